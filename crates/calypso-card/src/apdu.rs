//! APDU (Application Protocol Data Unit) command handling

use calypso_common::{status_name, sw};

use crate::error::ReaderError;
use crate::reader::Reader;

/// APDU response containing data and status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data (without status word)
    pub data: Vec<u8>,
    /// Status word SW1
    pub sw1: u8,
    /// Status word SW2
    pub sw2: u8,
}

impl ApduResponse {
    /// Split raw response bytes into data and status word
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ReaderError> {
        if raw.len() < 2 {
            return Err(ReaderError::ResponseTooShort(raw.len()));
        }
        let (data, status) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            sw1: status[0],
            sw2: status[1],
        })
    }

    /// Build a response from data and a 16-bit status word
    pub fn new(data: Vec<u8>, status_word: u16) -> Self {
        Self {
            data,
            sw1: (status_word >> 8) as u8,
            sw2: status_word as u8,
        }
    }

    /// Check if the response indicates success (9000)
    pub fn is_success(&self) -> bool {
        self.status_word() == sw::SUCCESS
    }

    /// Get the full status word as a 16-bit value
    pub fn status_word(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Get status word as hex string (e.g., "9000")
    pub fn status_string(&self) -> String {
        format!("{:02X}{:02X}", self.sw1, self.sw2)
    }

    /// Status word followed by its description, for logs
    pub fn status_description(&self) -> String {
        format!("{} ({})", self.status_string(), status_name(self.status_word()))
    }

    /// Raw bytes as received: data followed by SW1 SW2
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = self.data.clone();
        raw.push(self.sw1);
        raw.push(self.sw2);
        raw
    }
}

/// APDU command builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    le: Option<u8>,
}

impl ApduCommand {
    /// Create a new APDU command
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Set command data
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Set expected response length
    pub fn le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    /// Length of the data field (Lc), zero when absent
    pub fn lc(&self) -> usize {
        self.data.len()
    }

    /// Build the APDU command bytes
    pub fn build(&self) -> Vec<u8> {
        let mut apdu = vec![self.cla, self.ins, self.p1, self.p2];

        if !self.data.is_empty() {
            apdu.push(self.data.len() as u8);
            apdu.extend_from_slice(&self.data);
        }

        if let Some(le) = self.le {
            apdu.push(le);
        }

        apdu
    }

    /// Send this command through a reader
    pub fn send<R: Reader + ?Sized>(&self, reader: &mut R) -> Result<ApduResponse, ReaderError> {
        reader.transmit(&self.build())
    }
}

/// Instruction bytes of the Calypso PO command set
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const OPEN_SESSION: u8 = 0x8A;
    pub const CLOSE_SESSION: u8 = 0x8E;
    pub const READ_RECORDS: u8 = 0xB2;
    pub const UPDATE_RECORD: u8 = 0xDC;
    pub const WRITE_RECORD: u8 = 0xD2;
    pub const APPEND_RECORD: u8 = 0xE2;
    pub const INCREASE: u8 = 0x32;
    pub const DECREASE: u8 = 0x30;
    pub const SV_GET: u8 = 0x7C;
    pub const SV_RELOAD: u8 = 0xB8;
    pub const SV_DEBIT: u8 = 0xBA;
    pub const SV_UNDEBIT: u8 = 0xBC;
}

/// Calypso PO commands
pub mod commands {
    use super::{ins, ApduCommand};

    /// SELECT command (by DF name / AID)
    pub fn select(aid: &[u8]) -> ApduCommand {
        ApduCommand::new(0x00, ins::SELECT, 0x04, 0x00)
            .data(aid.to_vec())
            .le(0x00)
    }

    /// OPEN SECURE SESSION, revision 3 layout
    pub fn open_session_rev3(
        cla: u8,
        key_index: u8,
        sfi: u8,
        record_number: u8,
        sam_challenge: &[u8],
    ) -> ApduCommand {
        let mut data = Vec::with_capacity(1 + sam_challenge.len());
        data.push(0x00);
        data.extend_from_slice(sam_challenge);
        let p1 = (record_number << 3) | key_index;
        ApduCommand::new(cla, ins::OPEN_SESSION, p1, (sfi << 3) | 0x01)
            .data(data)
            .le(0x00)
    }

    /// OPEN SECURE SESSION, revision 2.4 layout
    pub fn open_session_rev24(
        cla: u8,
        key_index: u8,
        sfi: u8,
        record_number: u8,
        sam_challenge: &[u8],
    ) -> ApduCommand {
        ApduCommand::new(cla, ins::OPEN_SESSION, 0x80 | (record_number << 3) | key_index, sfi << 3)
            .data(sam_challenge.to_vec())
            .le(0x00)
    }

    /// OPEN SECURE SESSION, revision 1 layout
    pub fn open_session_rev10(
        cla: u8,
        key_index: u8,
        sfi: u8,
        record_number: u8,
        sam_challenge: &[u8],
    ) -> ApduCommand {
        ApduCommand::new(cla, ins::OPEN_SESSION, (record_number << 3) | key_index, sfi << 3)
            .data(sam_challenge.to_vec())
            .le(0x00)
    }

    /// CLOSE SECURE SESSION carrying the terminal half-session signature
    pub fn close_session(cla: u8, ratification_asked: bool, signature: &[u8]) -> ApduCommand {
        let p1 = if ratification_asked { 0x80 } else { 0x00 };
        ApduCommand::new(cla, ins::CLOSE_SESSION, p1, 0x00)
            .data(signature.to_vec())
            .le(0x00)
    }

    /// Ratification command sent right after closing in contactless mode
    pub fn ratification(cla: u8) -> ApduCommand {
        ApduCommand::new(cla, ins::READ_RECORDS, 0x00, 0x00).le(0x00)
    }

    /// READ RECORD(S): one record, or from `record_number` to the end of the response
    pub fn read_records(
        cla: u8,
        sfi: u8,
        record_number: u8,
        multiple: bool,
        expected_length: u8,
    ) -> ApduCommand {
        let p2 = (sfi << 3) | if multiple { 0x05 } else { 0x04 };
        ApduCommand::new(cla, ins::READ_RECORDS, record_number, p2).le(expected_length)
    }

    /// UPDATE RECORD
    pub fn update_record(cla: u8, sfi: u8, record_number: u8, data: &[u8]) -> ApduCommand {
        ApduCommand::new(cla, ins::UPDATE_RECORD, record_number, (sfi << 3) | 0x04)
            .data(data.to_vec())
    }

    /// WRITE RECORD (OR-ed into the existing content by the card)
    pub fn write_record(cla: u8, sfi: u8, record_number: u8, data: &[u8]) -> ApduCommand {
        ApduCommand::new(cla, ins::WRITE_RECORD, record_number, (sfi << 3) | 0x04)
            .data(data.to_vec())
    }

    /// APPEND RECORD on a cyclic file
    pub fn append_record(cla: u8, sfi: u8, data: &[u8]) -> ApduCommand {
        ApduCommand::new(cla, ins::APPEND_RECORD, 0x00, sfi << 3).data(data.to_vec())
    }

    /// INCREASE a counter by a 3-byte value
    pub fn increase(cla: u8, sfi: u8, counter_number: u8, value: u32) -> ApduCommand {
        ApduCommand::new(cla, ins::INCREASE, counter_number, sfi << 3)
            .data(value.to_be_bytes()[1..].to_vec())
            .le(0x00)
    }

    /// DECREASE a counter by a 3-byte value
    pub fn decrease(cla: u8, sfi: u8, counter_number: u8, value: u32) -> ApduCommand {
        ApduCommand::new(cla, ins::DECREASE, counter_number, sfi << 3)
            .data(value.to_be_bytes()[1..].to_vec())
            .le(0x00)
    }

    /// SV GET for a reload (P2 = 07) or a debit/undebit (P2 = 09)
    pub fn sv_get(cla: u8, reload: bool) -> ApduCommand {
        let p2 = if reload { 0x07 } else { 0x09 };
        ApduCommand::new(cla, ins::SV_GET, 0x00, p2).le(0x00)
    }

    /// SV RELOAD / SV DEBIT / SV UNDEBIT with the SAM complementary data appended
    pub fn sv_operation(cla: u8, instruction: u8, data: Vec<u8>) -> ApduCommand {
        ApduCommand::new(cla, instruction, 0x00, 0x00).data(data).le(0x00)
    }
}

/// SAM commands (Calypso SAM C1 class)
pub mod sam_commands {
    use super::ApduCommand;

    pub const SAM_CLA: u8 = 0x80;

    /// SELECT DIVERSIFIER with the PO serial number
    pub fn select_diversifier(serial_number: &[u8]) -> ApduCommand {
        ApduCommand::new(SAM_CLA, 0x14, 0x00, 0x00).data(serial_number.to_vec())
    }

    /// GET CHALLENGE
    pub fn get_challenge(length: u8) -> ApduCommand {
        ApduCommand::new(SAM_CLA, 0x84, 0x00, 0x00).le(length)
    }

    /// DIGEST INIT with the open session response.
    ///
    /// With a known KIF the key is referenced as `KIF KVC` (P2 = FF),
    /// otherwise by its record number in P2.
    pub fn digest_init(
        kif: Option<u8>,
        kvc: u8,
        key_record: u8,
        open_response: &[u8],
    ) -> ApduCommand {
        match kif {
            Some(kif) if kif != 0xFF => {
                let mut data = vec![kif, kvc];
                data.extend_from_slice(open_response);
                ApduCommand::new(SAM_CLA, 0x8A, 0x00, 0xFF).data(data)
            }
            _ => ApduCommand::new(SAM_CLA, 0x8A, 0x00, key_record).data(open_response.to_vec()),
        }
    }

    /// DIGEST UPDATE with one command or response
    pub fn digest_update(data: &[u8]) -> ApduCommand {
        ApduCommand::new(SAM_CLA, 0x8C, 0x00, 0x00).data(data.to_vec())
    }

    /// DIGEST CLOSE, returning the terminal half-session signature
    pub fn digest_close(signature_length: u8) -> ApduCommand {
        ApduCommand::new(SAM_CLA, 0x8E, 0x00, 0x00).le(signature_length)
    }

    /// DIGEST AUTHENTICATE with the card half-session signature
    pub fn digest_authenticate(signature: &[u8]) -> ApduCommand {
        ApduCommand::new(SAM_CLA, 0x82, 0x00, 0x00).data(signature.to_vec())
    }

    /// SV PREPARE LOAD (56) / DEBIT (54) / UNDEBIT (5C)
    pub fn sv_prepare(instruction: u8, data: Vec<u8>) -> ApduCommand {
        ApduCommand::new(SAM_CLA, instruction, 0x01, 0xFF).data(data)
    }

    /// SV CHECK with the card's SV signature
    pub fn sv_check(signature: &[u8]) -> ApduCommand {
        ApduCommand::new(SAM_CLA, 0x58, 0x00, 0x00).data(signature.to_vec())
    }
}
