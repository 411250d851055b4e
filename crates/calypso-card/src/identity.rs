//! Card identity decoding from the selection response
//!
//! A Calypso PO describes itself either through the FCI returned by SELECT
//! APPLICATION (revisions 2.4 and 3.x) or, for revision 1 cards that predate
//! the FCI, through a fixed 20-byte ATR. [`CardIdentity::decode`] branches
//! once on [`SelectionResponse`] and produces an immutable record.

use calypso_common::{find_path, sw, tags};
use tracing::trace;

use crate::apdu::ApduResponse;
use crate::budget::{buffer_size_from_indicator, BudgetUnit};
use crate::error::IdentityError;

const REV1_ATR_LENGTH: usize = 20;
const REV1_MODIFICATIONS_PER_SESSION: usize = 3;
const REV2_MODIFICATIONS_PER_SESSION: usize = 6;
const STARTUP_INFO_LENGTH: usize = 7;
const SERIAL_NUMBER_LENGTH: usize = 8;

/// Application type bits of the startup information
mod app_type {
    pub const PIN: u8 = 0x01;
    pub const STORED_VALUE: u8 = 0x02;
    pub const RATIFICATION_COMMAND_REQUIRED: u8 = 0x04;
    pub const REV3_2_MODE: u8 = 0x08;
    pub const PKI_REV3_3: u8 = 0x10;
}

/// Generation of the presented card
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoRevision {
    Rev1_0,
    Rev2_4,
    Rev3_1,
    Rev3_1Clap,
    Rev3_2,
}

impl PoRevision {
    /// Resolve the revision from the FCI application type byte
    ///
    /// `1xxxxxxx` is CLAP, `00101xxx` is 3.2, `00100xxx` is 3.1, anything else 2.4.
    pub fn from_application_type(application_type: u8) -> Self {
        if application_type & 0x80 != 0 {
            PoRevision::Rev3_1Clap
        } else if application_type >> 3 == 0x05 {
            PoRevision::Rev3_2
        } else if application_type >> 3 == 0x04 {
            PoRevision::Rev3_1
        } else {
            PoRevision::Rev2_4
        }
    }

    /// Class byte used for PO commands
    pub(crate) fn class_byte(self) -> u8 {
        match self {
            PoRevision::Rev1_0 | PoRevision::Rev2_4 => 0x94,
            _ => 0x00,
        }
    }
}

/// The raw selection outcome, either an FCI or only an ATR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionResponse {
    Fci {
        atr: Vec<u8>,
        fci: Vec<u8>,
        status_word: u16,
    },
    AtrOnly {
        atr: Vec<u8>,
    },
}

impl SelectionResponse {
    /// Build from the ATR and an optional SELECT APPLICATION response.
    ///
    /// The FCI is used when the select succeeded (9000) or reported an
    /// invalidated DF (6283); otherwise only the ATR is kept.
    pub fn from_parts(atr: Vec<u8>, select_response: Option<&ApduResponse>) -> Self {
        match select_response {
            Some(response)
                if response.is_success() || response.status_word() == sw::DF_INVALIDATED =>
            {
                SelectionResponse::Fci {
                    atr,
                    fci: response.data.clone(),
                    status_word: response.status_word(),
                }
            }
            _ => SelectionResponse::AtrOnly { atr },
        }
    }
}

/// Startup information block (7 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupInfo {
    pub buffer_size_indicator: u8,
    pub platform: u8,
    pub application_type: u8,
    pub application_subtype: u8,
    pub software_issuer: u8,
    pub software_version: u8,
    pub software_revision: u8,
}

impl StartupInfo {
    fn from_bytes(bytes: &[u8; STARTUP_INFO_LENGTH]) -> Self {
        Self {
            buffer_size_indicator: bytes[0],
            platform: bytes[1],
            application_type: bytes[2],
            application_subtype: bytes[3],
            software_issuer: bytes[4],
            software_version: bytes[5],
            software_revision: bytes[6],
        }
    }

    pub fn to_bytes(&self) -> [u8; STARTUP_INFO_LENGTH] {
        [
            self.buffer_size_indicator,
            self.platform,
            self.application_type,
            self.application_subtype,
            self.software_issuer,
            self.software_version,
            self.software_revision,
        ]
    }
}

/// Capabilities derived from the application type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub confidential_session: bool,
    pub deselect_ratification: bool,
    pub public_authentication: bool,
    pub stored_value: bool,
    pub pin: bool,
}

/// Session modification limits of the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionBufferParams {
    pub max: usize,
    pub unit: BudgetUnit,
}

/// Immutable self-description of a selected card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardIdentity {
    revision: PoRevision,
    serial_number: [u8; SERIAL_NUMBER_LENGTH],
    df_name: Option<Vec<u8>>,
    startup_info: StartupInfo,
    capabilities: Capabilities,
    df_invalidated: bool,
    session_buffer: SessionBufferParams,
    atr: Vec<u8>,
}

impl CardIdentity {
    /// Decode the identity from a selection response
    pub fn decode(selection: &SelectionResponse) -> Result<Self, IdentityError> {
        let identity = match selection {
            SelectionResponse::Fci { atr, fci, status_word } => decode_fci(atr, fci, *status_word)?,
            SelectionResponse::AtrOnly { atr } => decode_atr(atr)?,
        };

        trace!(
            revision = ?identity.revision,
            serial_number = %identity.serial_number_hex(),
            df_name = %identity.df_name_hex(),
            "card identity decoded"
        );
        Ok(identity)
    }

    pub fn revision(&self) -> PoRevision {
        self.revision
    }

    pub fn serial_number(&self) -> &[u8; SERIAL_NUMBER_LENGTH] {
        &self.serial_number
    }

    pub fn serial_number_hex(&self) -> String {
        hex::encode_upper(self.serial_number)
    }

    /// DF name (5 to 16 bytes), absent for revision 1 cards
    pub fn df_name(&self) -> Option<&[u8]> {
        self.df_name.as_deref()
    }

    pub fn df_name_hex(&self) -> String {
        self.df_name.as_deref().map(hex::encode_upper).unwrap_or_default()
    }

    pub fn startup_info(&self) -> StartupInfo {
        self.startup_info
    }

    pub fn startup_info_hex(&self) -> String {
        hex::encode_upper(self.startup_info.to_bytes())
    }

    pub fn platform(&self) -> u8 {
        self.startup_info.platform
    }

    pub fn application_type(&self) -> u8 {
        self.startup_info.application_type
    }

    pub fn application_subtype(&self) -> u8 {
        self.startup_info.application_subtype
    }

    pub fn software_issuer(&self) -> u8 {
        self.startup_info.software_issuer
    }

    pub fn software_version(&self) -> u8 {
        self.startup_info.software_version
    }

    pub fn software_revision(&self) -> u8 {
        self.startup_info.software_revision
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_confidential_session_supported(&self) -> bool {
        self.capabilities.confidential_session
    }

    pub fn is_deselect_ratification_supported(&self) -> bool {
        self.capabilities.deselect_ratification
    }

    pub fn is_public_authentication_supported(&self) -> bool {
        self.capabilities.public_authentication
    }

    pub fn is_stored_value_available(&self) -> bool {
        self.capabilities.stored_value
    }

    pub fn is_pin_available(&self) -> bool {
        self.capabilities.pin
    }

    pub fn is_df_invalidated(&self) -> bool {
        self.df_invalidated
    }

    /// Maximum modifications per session, in [`Self::modification_counter_unit`]
    pub fn modification_counter_max(&self) -> usize {
        self.session_buffer.max
    }

    pub fn modification_counter_unit(&self) -> BudgetUnit {
        self.session_buffer.unit
    }

    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    pub fn atr_hex(&self) -> String {
        hex::encode_upper(&self.atr)
    }

    pub(crate) fn class_byte(&self) -> u8 {
        self.revision.class_byte()
    }

    pub(crate) fn session_buffer(&self) -> SessionBufferParams {
        self.session_buffer
    }
}

fn malformed(message: &str) -> IdentityError {
    IdentityError::MalformedCardResponse(message.to_string())
}

fn decode_fci(atr: &[u8], fci: &[u8], status_word: u16) -> Result<CardIdentity, IdentityError> {
    let df_name = find_path(fci, &[tags::FCI_TEMPLATE, tags::DF_NAME])
        .ok_or_else(|| malformed("DF name (84) not found"))?;
    if !(5..=16).contains(&df_name.len()) {
        return Err(IdentityError::MalformedCardResponse(format!(
            "DF name length {} outside 5..=16",
            df_name.len()
        )));
    }

    let discretionary = find_path(
        fci,
        &[
            tags::FCI_TEMPLATE,
            tags::FCI_PROPRIETARY_TEMPLATE,
            tags::FCI_ISSUER_DISCRETIONARY_DATA,
        ],
    )
    .ok_or_else(|| malformed("issuer discretionary data (BF0C) not found"))?;

    let serial_number: [u8; SERIAL_NUMBER_LENGTH] =
        find_path(discretionary, &[tags::APPLICATION_SERIAL_NUMBER])
            .and_then(|serial| serial.try_into().ok())
            .ok_or_else(|| malformed("serial number (C7) missing or not 8 bytes"))?;

    let startup_bytes: &[u8; STARTUP_INFO_LENGTH] =
        find_path(discretionary, &[tags::DISCRETIONARY_DATA])
            .and_then(|data| data.get(..STARTUP_INFO_LENGTH))
            .and_then(|data| data.try_into().ok())
            .ok_or_else(|| malformed("startup information (53) shorter than 7 bytes"))?;
    let startup_info = StartupInfo::from_bytes(startup_bytes);

    let application_type = startup_info.application_type;
    let revision = PoRevision::from_application_type(application_type);

    let session_buffer = if revision == PoRevision::Rev2_4 {
        SessionBufferParams {
            max: REV2_MODIFICATIONS_PER_SESSION,
            unit: BudgetUnit::Commands,
        }
    } else {
        SessionBufferParams {
            max: buffer_size_from_indicator(startup_info.buffer_size_indicator),
            unit: BudgetUnit::Bytes,
        }
    };

    let capabilities = Capabilities {
        confidential_session: application_type & app_type::REV3_2_MODE != 0,
        deselect_ratification: application_type & app_type::RATIFICATION_COMMAND_REQUIRED == 0,
        public_authentication: application_type & app_type::PKI_REV3_3 != 0,
        stored_value: application_type & app_type::STORED_VALUE != 0,
        pin: application_type & app_type::PIN != 0,
    };

    Ok(CardIdentity {
        revision,
        serial_number,
        df_name: Some(df_name.to_vec()),
        startup_info,
        capabilities,
        df_invalidated: status_word == sw::DF_INVALIDATED,
        session_buffer,
        atr: atr.to_vec(),
    })
}

fn decode_atr(atr: &[u8]) -> Result<CardIdentity, IdentityError> {
    if atr.len() != REV1_ATR_LENGTH {
        return Err(IdentityError::UnexpectedAtrLength(atr.len()));
    }

    // Serial number bytes 12..16 land at offset 4 of a zero-filled 8-byte buffer
    let mut serial_number = [0u8; SERIAL_NUMBER_LENGTH];
    serial_number[4..].copy_from_slice(&atr[12..16]);

    let startup_info = StartupInfo {
        buffer_size_indicator: 0,
        platform: atr[6],
        application_type: atr[7],
        application_subtype: atr[8],
        software_issuer: atr[9],
        software_version: atr[10],
        software_revision: atr[11],
    };

    Ok(CardIdentity {
        revision: PoRevision::Rev1_0,
        serial_number,
        df_name: None,
        startup_info,
        capabilities: Capabilities {
            deselect_ratification: true,
            ..Capabilities::default()
        },
        df_invalidated: false,
        session_buffer: SessionBufferParams {
            max: REV1_MODIFICATIONS_PER_SESSION,
            unit: BudgetUnit::Commands,
        },
        atr: atr.to_vec(),
    })
}
