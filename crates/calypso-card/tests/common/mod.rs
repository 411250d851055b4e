//! Simulated Calypso card and SAM shared by the integration tests
//!
//! Both sides keep the same transcript (open response, then every in-session
//! command and response) and derive their half-session signatures from it
//! with SHA-1, so a session only verifies when both saw the same exchanges.

#![allow(dead_code)]

use std::collections::HashMap;

use calypso_card::apdu::{ins, ApduResponse};
use calypso_card::error::{ReaderError, SessionError};
use calypso_card::identity::{CardIdentity, SelectionResponse};
use calypso_card::reader::Reader;
use calypso_card::sam::SamSession;
use calypso_card::stored_value::SvAction;
use calypso_card::AccessLevel;
use calypso_common::{be_int, be_uint, to_be_bytes};
use sha1::{Digest, Sha1};
use tracing_subscriber::EnvFilter;

const CARD_SIDE: u8 = 0xCA;
const TERMINAL_SIDE: u8 = 0x7E;
const SV_SIDE: u8 = 0x5F;

pub const APP_TYPE_REV3: u8 = 0x20;
pub const APP_TYPE_REV3_SV: u8 = 0x22;
pub const APP_TYPE_REV24: u8 = 0x06;

pub const SAM_ID: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn half_signature(transcript: &[u8], side: u8) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(transcript);
    hasher.update([side]);
    hasher.finalize()[..4].to_vec()
}

fn sv_signature(command_data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(command_data);
    hasher.update([SV_SIDE]);
    hasher.finalize()[..3].to_vec()
}

/// FCI of a Calypso application with the given startup information
pub fn fci(startup: [u8; 7]) -> Vec<u8> {
    let mut bf0c = vec![0xC7, 0x08, 0x00, 0x00, 0x00, 0x00, 0x7A, 0xB1, 0x11, 0x42];
    bf0c.extend_from_slice(&[0x53, 0x07]);
    bf0c.extend_from_slice(&startup);

    let mut a5 = vec![0xBF, 0x0C, bf0c.len() as u8];
    a5.extend(bf0c);

    let mut body = vec![0x84, 0x08, 0x31, 0x54, 0x49, 0x43, 0x2E, 0x49, 0x43, 0x41];
    body.extend_from_slice(&[0xA5, a5.len() as u8]);
    body.extend(a5);

    let mut fci = vec![0x6F, body.len() as u8];
    fci.extend(body);
    fci
}

/// Identity of an FCI-describing card
pub fn card_identity(buffer_size_indicator: u8, application_type: u8) -> CardIdentity {
    let startup = [buffer_size_indicator, 0x3C, application_type, 0x11, 0x01, 0x01, 0x01];
    let response = ApduResponse::new(fci(startup), 0x9000);
    let atr = vec![0x3B, 0x88, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    CardIdentity::decode(&SelectionResponse::from_parts(atr, Some(&response))).unwrap()
}

fn ok(data: Vec<u8>) -> ApduResponse {
    ApduResponse::new(data, 0x9000)
}

fn status(status_word: u16) -> ApduResponse {
    ApduResponse::new(Vec::new(), status_word)
}

/// Simulated Calypso PO behind the reader seam
pub struct MockCard {
    pub rev3: bool,
    pub kif: u8,
    pub kvc: u8,
    pub ratified: bool,
    pub records: HashMap<(u8, u8), Vec<u8>>,
    pub counters: HashMap<(u8, u8), u32>,
    pub sv_balance: i32,
    pub sv_transaction_number: u16,
    /// Status word returned for every command with this instruction byte
    pub rejections: HashMap<u8, u16>,
    /// Card half-session signature returned instead of the computed one
    pub forced_signature: Option<Vec<u8>>,
    pub check_terminal_mac: bool,
    pub received: Vec<Vec<u8>>,
    transcript: Option<Vec<u8>>,
    postponed: Vec<Vec<u8>>,
    load_log: Vec<u8>,
    debit_log: Vec<u8>,
}

impl MockCard {
    pub fn new() -> Self {
        let mut records = HashMap::new();
        records.insert((0x07, 1), vec![0x24; 29]);
        records.insert((0x08, 1), vec![0x01; 29]);
        records.insert((0x08, 2), vec![0x02; 29]);
        let mut counters = HashMap::new();
        counters.insert((0x19, 1), 100);

        Self {
            rev3: true,
            kif: 0x30,
            kvc: 0x79,
            ratified: true,
            records,
            counters,
            sv_balance: 1000,
            sv_transaction_number: 0x0010,
            rejections: HashMap::new(),
            forced_signature: None,
            check_terminal_mac: true,
            received: Vec::new(),
            transcript: None,
            postponed: Vec::new(),
            load_log: vec![0u8; 22],
            debit_log: vec![0u8; 19],
        }
    }

    pub fn rev24() -> Self {
        Self {
            rev3: false,
            ..Self::new()
        }
    }

    pub fn in_session(&self) -> bool {
        self.transcript.is_some()
    }

    /// Instruction bytes of the commands received, in order
    pub fn instructions(&self) -> Vec<u8> {
        self.received.iter().map(|apdu| apdu[1]).collect()
    }

    fn respond(&mut self, apdu: &[u8]) -> ApduResponse {
        let (instruction, p1, p2) = (apdu[1], apdu[2], apdu[3]);
        let data = if apdu.len() > 5 {
            apdu[5..5 + apdu[4] as usize].to_vec()
        } else {
            Vec::new()
        };

        if let Some(&status_word) = self.rejections.get(&instruction) {
            return status(status_word);
        }

        match instruction {
            ins::OPEN_SESSION => self.open(p1, p2),
            ins::CLOSE_SESSION => self.close(&data),
            ins::READ_RECORDS => match self.records.get(&(p2 >> 3, p1)) {
                Some(record) => ok(record.clone()),
                None => status(0x6A83),
            },
            ins::UPDATE_RECORD => {
                self.records.insert((p2 >> 3, p1), data);
                ok(Vec::new())
            }
            ins::WRITE_RECORD => {
                let record = self
                    .records
                    .entry((p2 >> 3, p1))
                    .or_insert_with(|| vec![0; data.len()]);
                for (current, new) in record.iter_mut().zip(&data) {
                    *current |= new;
                }
                ok(Vec::new())
            }
            ins::APPEND_RECORD => {
                self.records.insert((p2 >> 3, 1), data);
                ok(Vec::new())
            }
            ins::INCREASE | ins::DECREASE => {
                let counter = self.counters.entry((p2 >> 3, p1)).or_insert(0);
                let value = be_uint(&data);
                let updated = if instruction == ins::INCREASE {
                    counter.wrapping_add(value)
                } else {
                    counter.wrapping_sub(value)
                };
                *counter = updated & 0x00FF_FFFF;
                ok(counter.to_be_bytes()[1..].to_vec())
            }
            ins::SV_GET => self.sv_get(p2 == 0x07),
            ins::SV_RELOAD | ins::SV_DEBIT | ins::SV_UNDEBIT => {
                self.sv_operation(instruction, &data)
            }
            _ => status(0x6D00),
        }
    }

    fn open(&mut self, p1: u8, p2: u8) -> ApduResponse {
        let sfi = p2 >> 3;
        let record_number = (p1 >> 3) & 0x0F;
        let record = if record_number != 0 {
            self.records.get(&(sfi, record_number)).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };

        let data = if self.rev3 {
            let mut data = vec![0x00, 0x00, 0x2A, 0x5C];
            data.push(if self.ratified { 0x00 } else { 0x01 });
            data.extend_from_slice(&[self.kif, self.kvc, record.len() as u8]);
            data.extend(record);
            data
        } else {
            let mut data = vec![self.kvc, 0x00, 0x00, 0x2A, 0x5C];
            if record_number != 0 {
                let mut record = record;
                record.resize(29, 0x00);
                data.extend(record);
            }
            if !self.ratified {
                data.extend_from_slice(&[0x00, 0x00]);
            }
            data
        };

        self.transcript = Some(data.clone());
        self.postponed.clear();
        ok(data)
    }

    fn close(&mut self, terminal_mac: &[u8]) -> ApduResponse {
        let Some(transcript) = self.transcript.take() else {
            return status(0x6985);
        };
        let expected_mac = half_signature(&transcript, TERMINAL_SIDE);
        if self.check_terminal_mac && terminal_mac != expected_mac.as_slice() {
            return status(0x6988);
        }

        let mut data = Vec::new();
        for item in self.postponed.drain(..) {
            data.push(item.len() as u8);
            data.extend(item);
        }
        let signature = self
            .forced_signature
            .clone()
            .unwrap_or_else(|| half_signature(&transcript, CARD_SIDE));
        data.extend(signature);
        self.ratified = true;
        ok(data)
    }

    fn sv_get(&mut self, reload: bool) -> ApduResponse {
        let mut data = vec![self.kvc];
        data.extend_from_slice(&self.sv_transaction_number.to_be_bytes());
        data.extend_from_slice(&[0xA1, 0xA2, 0xA3, 0xC1, 0xC2]);
        data.extend(to_be_bytes(self.sv_balance, 3));
        data.extend_from_slice(if reload { &self.load_log } else { &self.debit_log });
        ok(data)
    }

    fn sv_operation(&mut self, instruction: u8, data: &[u8]) -> ApduResponse {
        let tnum = self.sv_transaction_number.to_be_bytes();
        if instruction == ins::SV_RELOAD {
            let amount = be_int(&data[5..8]);
            let complementary = &data[10..];
            self.sv_balance += amount;
            let mut log = data[0..5].to_vec();
            log.extend(to_be_bytes(self.sv_balance, 3));
            log.extend_from_slice(&data[5..10]);
            log.extend_from_slice(&complementary[0..7]);
            log.extend_from_slice(&tnum);
            self.load_log = log;
        } else {
            let amount = be_uint(&data[0..2]) as i32;
            let complementary = &data[7..];
            if instruction == ins::SV_DEBIT {
                self.sv_balance -= amount;
            } else {
                self.sv_balance += amount;
            }
            let mut log = data[0..7].to_vec();
            log.extend_from_slice(&complementary[0..7]);
            log.extend(to_be_bytes(self.sv_balance, 3));
            log.extend_from_slice(&tnum);
            self.debit_log = log;
        }
        self.sv_transaction_number = self.sv_transaction_number.wrapping_add(1);

        let signature = sv_signature(data);
        if self.in_session() {
            self.postponed.push(signature);
            ok(Vec::new())
        } else {
            ok(signature)
        }
    }
}

impl Reader for MockCard {
    fn transmit(&mut self, apdu: &[u8]) -> Result<ApduResponse, ReaderError> {
        self.received.push(apdu.to_vec());
        let response = self.respond(apdu);
        if apdu[1] != ins::OPEN_SESSION && apdu[1] != ins::CLOSE_SESSION {
            if let Some(transcript) = self.transcript.as_mut() {
                transcript.extend_from_slice(apdu);
                transcript.extend(response.to_bytes());
            }
        }
        Ok(response)
    }

    fn is_card_present(&self) -> bool {
        true
    }
}

/// Deterministic SAM computing the same transcript signatures as [`MockCard`]
#[derive(Default)]
pub struct MockSam {
    /// Terminal MAC returned instead of the computed one
    pub forced_mac: Option<Vec<u8>>,
    pub reject_sv_signatures: bool,
    pub calls: Vec<&'static str>,
    pub sv_checks: usize,
    pub access_level: Option<AccessLevel>,
    pub digest_kif: Option<u8>,
    transcript: Vec<u8>,
    expected_sv_signatures: Vec<Vec<u8>>,
    transaction_number: u32,
}

impl MockSam {
    /// SAM whose terminal MAC is `mac` whatever the transcript
    pub fn with_forced_mac(mac: &[u8]) -> Self {
        Self {
            forced_mac: Some(mac.to_vec()),
            ..Self::default()
        }
    }

    /// SAM that refuses every SV signature it is asked to check
    pub fn rejecting_sv_signatures() -> Self {
        Self {
            reject_sv_signatures: true,
            ..Self::default()
        }
    }
}

impl SamSession for MockSam {
    fn select_diversifier(&mut self, _serial_number: &[u8]) -> Result<(), SessionError> {
        self.calls.push("select_diversifier");
        Ok(())
    }

    fn get_challenge(&mut self) -> Result<Vec<u8>, SessionError> {
        self.calls.push("get_challenge");
        Ok(vec![0x11, 0x22, 0x33, 0x44])
    }

    fn begin_digest(
        &mut self,
        open_response: &[u8],
        kif: Option<u8>,
        _kvc: u8,
        access_level: AccessLevel,
    ) -> Result<(), SessionError> {
        self.calls.push("begin_digest");
        self.access_level = Some(access_level);
        self.digest_kif = kif;
        self.transcript = open_response.to_vec();
        Ok(())
    }

    fn update_digest(&mut self, command: &[u8], response: &[u8]) -> Result<(), SessionError> {
        self.calls.push("update_digest");
        self.transcript.extend_from_slice(command);
        self.transcript.extend_from_slice(response);
        Ok(())
    }

    fn finalize_digest_and_mac(&mut self) -> Result<Vec<u8>, SessionError> {
        self.calls.push("finalize_digest_and_mac");
        Ok(self
            .forced_mac
            .clone()
            .unwrap_or_else(|| half_signature(&self.transcript, TERMINAL_SIDE)))
    }

    fn verify_mac(&mut self, card_mac: &[u8]) -> Result<bool, SessionError> {
        self.calls.push("verify_mac");
        Ok(card_mac == half_signature(&self.transcript, CARD_SIDE).as_slice())
    }

    fn sv_prepare(
        &mut self,
        _action: SvAction,
        _sv_get_command: &[u8],
        _sv_get_response: &[u8],
        partial_command: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        self.calls.push("sv_prepare");
        self.transaction_number += 1;
        let mut complementary = SAM_ID.to_vec();
        complementary.extend_from_slice(&self.transaction_number.to_be_bytes()[1..]);
        complementary.extend_from_slice(&[0xA5; 5]);

        let mut command_data = partial_command.to_vec();
        command_data.extend_from_slice(&complementary);
        self.expected_sv_signatures.push(sv_signature(&command_data));
        Ok(complementary)
    }

    fn sv_check(&mut self, card_signature: &[u8]) -> Result<bool, SessionError> {
        self.calls.push("sv_check");
        self.sv_checks += 1;
        if self.expected_sv_signatures.is_empty() {
            return Ok(false);
        }
        let expected = self.expected_sv_signatures.remove(0);
        Ok(!self.reject_sv_signatures && card_signature == expected.as_slice())
    }
}
