//! SAM collaborator: the message sequence exchanged with the security module
//!
//! The engine only sees [`SamSession`]; key material stays inside the SAM.
//! [`CalypsoSam`] drives a Calypso SAM through any [`Reader`].

use calypso_common::sw;
use calypso_keys::AccessLevel;
use tracing::{debug, trace};

use crate::apdu::{sam_commands, ApduCommand, ApduResponse};
use crate::error::SessionError;
use crate::reader::Reader;
use crate::stored_value::SvAction;

/// Operations the secure session engine needs from a SAM
pub trait SamSession {
    /// Diversify the session keys with the card serial number
    fn select_diversifier(&mut self, serial_number: &[u8]) -> Result<(), SessionError>;

    /// Terminal challenge sent in the Open Secure Session command
    fn get_challenge(&mut self) -> Result<Vec<u8>, SessionError>;

    /// Start the session digest from the card's open-session response
    fn begin_digest(
        &mut self,
        open_response: &[u8],
        kif: Option<u8>,
        kvc: u8,
        access_level: AccessLevel,
    ) -> Result<(), SessionError>;

    /// Extend the digest with one in-session command and its response
    fn update_digest(&mut self, command: &[u8], response: &[u8]) -> Result<(), SessionError>;

    /// Close the digest and return the terminal half-session signature
    fn finalize_digest_and_mac(&mut self) -> Result<Vec<u8>, SessionError>;

    /// Check the card half-session signature returned by Close Secure Session
    fn verify_mac(&mut self, card_mac: &[u8]) -> Result<bool, SessionError>;

    /// Compute the SAM part (SAM id, SAM transaction number, signature) of an SV command
    fn sv_prepare(
        &mut self,
        action: SvAction,
        sv_get_command: &[u8],
        sv_get_response: &[u8],
        partial_command: &[u8],
    ) -> Result<Vec<u8>, SessionError>;

    /// Check the SV signature returned by the card
    fn sv_check(&mut self, card_signature: &[u8]) -> Result<bool, SessionError>;
}

impl<S: SamSession + ?Sized> SamSession for &mut S {
    fn select_diversifier(&mut self, serial_number: &[u8]) -> Result<(), SessionError> {
        (**self).select_diversifier(serial_number)
    }

    fn get_challenge(&mut self) -> Result<Vec<u8>, SessionError> {
        (**self).get_challenge()
    }

    fn begin_digest(
        &mut self,
        open_response: &[u8],
        kif: Option<u8>,
        kvc: u8,
        access_level: AccessLevel,
    ) -> Result<(), SessionError> {
        (**self).begin_digest(open_response, kif, kvc, access_level)
    }

    fn update_digest(&mut self, command: &[u8], response: &[u8]) -> Result<(), SessionError> {
        (**self).update_digest(command, response)
    }

    fn finalize_digest_and_mac(&mut self) -> Result<Vec<u8>, SessionError> {
        (**self).finalize_digest_and_mac()
    }

    fn verify_mac(&mut self, card_mac: &[u8]) -> Result<bool, SessionError> {
        (**self).verify_mac(card_mac)
    }

    fn sv_prepare(
        &mut self,
        action: SvAction,
        sv_get_command: &[u8],
        sv_get_response: &[u8],
        partial_command: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        (**self).sv_prepare(action, sv_get_command, sv_get_response, partial_command)
    }

    fn sv_check(&mut self, card_signature: &[u8]) -> Result<bool, SessionError> {
        (**self).sv_check(card_signature)
    }
}

/// A Calypso SAM reached through a reader
pub struct CalypsoSam<R: Reader> {
    reader: R,
    challenge_length: u8,
    signature_length: u8,
}

impl<R: Reader> CalypsoSam<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            challenge_length: 4,
            signature_length: 4,
        }
    }

    pub fn into_reader(self) -> R {
        self.reader
    }

    fn exchange(
        &mut self,
        name: &'static str,
        command: ApduCommand,
    ) -> Result<ApduResponse, SessionError> {
        let response = command.send(&mut self.reader)?;
        trace!(command = name, sw = %response.status_string(), "SAM exchange");
        Ok(response)
    }

    fn expect_success(
        &mut self,
        name: &'static str,
        command: ApduCommand,
    ) -> Result<Vec<u8>, SessionError> {
        let response = self.exchange(name, command)?;
        if !response.is_success() {
            return Err(SessionError::SamRejected {
                command: name,
                status_word: response.status_word(),
            });
        }
        Ok(response.data)
    }

    /// 9000 means verified, 6988 means a wrong signature; anything else is a SAM failure
    fn signature_check(
        &mut self,
        name: &'static str,
        command: ApduCommand,
    ) -> Result<bool, SessionError> {
        let response = self.exchange(name, command)?;
        match response.status_word() {
            sw::SUCCESS => Ok(true),
            sw::INCORRECT_SIGNATURE => Ok(false),
            status_word => Err(SessionError::SamRejected { command: name, status_word }),
        }
    }
}

impl<R: Reader> SamSession for CalypsoSam<R> {
    fn select_diversifier(&mut self, serial_number: &[u8]) -> Result<(), SessionError> {
        self.expect_success("Select Diversifier", sam_commands::select_diversifier(serial_number))?;
        Ok(())
    }

    fn get_challenge(&mut self) -> Result<Vec<u8>, SessionError> {
        let command = sam_commands::get_challenge(self.challenge_length);
        let challenge = self.expect_success("Get Challenge", command)?;
        if challenge.len() != self.challenge_length as usize {
            return Err(SessionError::Malformed(format!(
                "SAM challenge of {} bytes",
                challenge.len()
            )));
        }
        Ok(challenge)
    }

    fn begin_digest(
        &mut self,
        open_response: &[u8],
        kif: Option<u8>,
        kvc: u8,
        access_level: AccessLevel,
    ) -> Result<(), SessionError> {
        debug!(?kif, kvc, ?access_level, "digest init");
        let command = sam_commands::digest_init(kif, kvc, access_level.key_index(), open_response);
        self.expect_success("Digest Init", command)?;
        Ok(())
    }

    fn update_digest(&mut self, command: &[u8], response: &[u8]) -> Result<(), SessionError> {
        self.expect_success("Digest Update", sam_commands::digest_update(command))?;
        self.expect_success("Digest Update", sam_commands::digest_update(response))?;
        Ok(())
    }

    fn finalize_digest_and_mac(&mut self) -> Result<Vec<u8>, SessionError> {
        self.expect_success("Digest Close", sam_commands::digest_close(self.signature_length))
    }

    fn verify_mac(&mut self, card_mac: &[u8]) -> Result<bool, SessionError> {
        self.signature_check("Digest Authenticate", sam_commands::digest_authenticate(card_mac))
    }

    fn sv_prepare(
        &mut self,
        action: SvAction,
        sv_get_command: &[u8],
        sv_get_response: &[u8],
        partial_command: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let instruction = match action {
            SvAction::Reload => 0x56,
            SvAction::Debit => 0x54,
            SvAction::Undebit => 0x5C,
        };
        // SV Get header (CLA INS P1 P2), the SV Get response, then the partial SV command
        let mut data = sv_get_command.get(..4).unwrap_or(sv_get_command).to_vec();
        data.extend_from_slice(sv_get_response);
        data.extend_from_slice(partial_command);
        self.expect_success("SV Prepare", sam_commands::sv_prepare(instruction, data))
    }

    fn sv_check(&mut self, card_signature: &[u8]) -> Result<bool, SessionError> {
        self.signature_check("SV Check", sam_commands::sv_check(card_signature))
    }
}
