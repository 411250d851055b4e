//! Reader transport: the synchronous exchange seam and its PC/SC implementation

use std::ffi::CStr;

use pcsc::{Card, Context, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};
use tracing::trace;

use crate::apdu::ApduResponse;
use crate::error::ReaderError;

/// A synchronous card (or SAM) channel.
///
/// Anything that can exchange APDUs in order may stand in for a physical
/// reader: a PC/SC slot, a pooled resource or a network-virtualized reader.
pub trait Reader {
    /// Send one command APDU and wait for its response
    fn transmit(&mut self, apdu: &[u8]) -> Result<ApduResponse, ReaderError>;

    /// Whether a card is currently present
    fn is_card_present(&self) -> bool;

    /// Answer To Reset of the current card, if known
    fn atr(&self) -> Option<Vec<u8>> {
        None
    }
}

impl<R: Reader + ?Sized> Reader for &mut R {
    fn transmit(&mut self, apdu: &[u8]) -> Result<ApduResponse, ReaderError> {
        (**self).transmit(apdu)
    }

    fn is_card_present(&self) -> bool {
        (**self).is_card_present()
    }

    fn atr(&self) -> Option<Vec<u8>> {
        (**self).atr()
    }
}

/// PC/SC context wrapper for listing readers and connecting to cards
pub struct CardReader {
    context: Context,
}

impl CardReader {
    /// Create a new CardReader by establishing a PC/SC context
    pub fn new() -> Result<Self, ReaderError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self { context })
    }

    /// List all available card readers
    pub fn list_readers(&self) -> Result<Vec<String>, ReaderError> {
        let mut readers_buf = [0; 2048];
        let readers = self.context.list_readers(&mut readers_buf)?;

        Ok(readers
            .map(|r| r.to_string_lossy().into_owned())
            .collect())
    }

    /// Connect to the first reader holding a card
    pub fn connect_first(&self) -> Result<PcscReader, ReaderError> {
        let mut readers_buf = [0; 2048];
        let readers = self.context.list_readers(&mut readers_buf)?;

        for reader in readers {
            if let Ok(card) = self.context.connect(reader, ShareMode::Shared, Protocols::ANY) {
                return Ok(PcscReader::new(card, reader.to_string_lossy().into_owned()));
            }
        }
        Err(ReaderError::CardAbsent)
    }

    /// Connect to a specific reader by name
    pub fn connect(&self, reader_name: &CStr) -> Result<PcscReader, ReaderError> {
        let card = self.context.connect(reader_name, ShareMode::Shared, Protocols::ANY)?;
        Ok(PcscReader::new(card, reader_name.to_string_lossy().into_owned()))
    }
}

/// A connected PC/SC card channel
pub struct PcscReader {
    card: Card,
    name: String,
}

impl PcscReader {
    fn new(card: Card, name: String) -> Self {
        Self { card, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Reader for PcscReader {
    fn transmit(&mut self, apdu: &[u8]) -> Result<ApduResponse, ReaderError> {
        let mut rapdu_buf = [0; MAX_BUFFER_SIZE];
        trace!(reader = %self.name, apdu = %hex::encode_upper(apdu), "transmit");
        let rapdu = self.card.transmit(apdu, &mut rapdu_buf)?;
        trace!(reader = %self.name, response = %hex::encode_upper(rapdu), "received");
        ApduResponse::from_bytes(rapdu)
    }

    fn is_card_present(&self) -> bool {
        self.card
            .status2_owned()
            .map(|status| status.status().contains(pcsc::Status::PRESENT))
            .unwrap_or(false)
    }

    fn atr(&self) -> Option<Vec<u8>> {
        self.card
            .status2_owned()
            .ok()
            .map(|status| status.atr().to_vec())
    }
}
