//! Stored Value (SV) data: SV Get parsing, log records and amount policy

use calypso_common::{be_int, be_uint, to_be_bytes};

use crate::error::SessionError;

const SV_GET_RELOAD_LENGTH: usize = 0x21;
const SV_GET_DEBIT_LENGTH: usize = 0x1E;
const LOAD_LOG_LENGTH: usize = 22;
const DEBIT_LOG_LENGTH: usize = 19;
const LOG_OFFSET: usize = 11;

/// Reload amounts are 3-byte signed values
pub const RELOAD_AMOUNT_MIN: i32 = -8_388_608;
pub const RELOAD_AMOUNT_MAX: i32 = 8_388_607;
/// Debit and undebit amounts are 2-byte non-negative values
pub const DEBIT_AMOUNT_MIN: i32 = 0;
pub const DEBIT_AMOUNT_MAX: i32 = 32_767;

/// Which SV Get a value-changing command depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvOperation {
    Reload,
    Debit,
}

/// Value-changing SV command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvAction {
    Reload,
    Debit,
    Undebit,
}

impl SvAction {
    /// The SV Get operation that must precede this action
    pub fn operation(self) -> SvOperation {
        match self {
            SvAction::Reload => SvOperation::Reload,
            SvAction::Debit | SvAction::Undebit => SvOperation::Debit,
        }
    }

    pub fn amount_range(self) -> (i32, i32) {
        match self {
            SvAction::Reload => (RELOAD_AMOUNT_MIN, RELOAD_AMOUNT_MAX),
            SvAction::Debit | SvAction::Undebit => (DEBIT_AMOUNT_MIN, DEBIT_AMOUNT_MAX),
        }
    }

    /// Balance after applying `amount` to `balance`
    pub fn resulting_balance(self, balance: i32, amount: i32) -> i32 {
        match self {
            SvAction::Reload | SvAction::Undebit => balance.saturating_add(amount),
            SvAction::Debit => balance.saturating_sub(amount),
        }
    }
}

/// How many logs SV Get retrieves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SvLogRead {
    /// Only the log matching the requested operation
    #[default]
    Single,
    /// Both the load and the debit logs
    All,
}

/// Local limits applied before an SV command is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SvPolicy {
    /// Lowest balance a debit or negative reload may leave
    pub negative_balance_floor: i32,
}

impl SvPolicy {
    /// Reject out-of-range amounts and balances below the floor
    pub fn check(&self, action: SvAction, balance: i32, amount: i32) -> Result<(), SessionError> {
        let (min, max) = action.amount_range();
        if amount < min || amount > max {
            return Err(SessionError::SvAmountOutOfRange { amount, min, max });
        }
        let resulting = action.resulting_balance(balance, amount);
        if resulting < self.negative_balance_floor && resulting < balance {
            return Err(SessionError::SvNegativeBalance {
                balance: resulting,
                floor: self.negative_balance_floor,
            });
        }
        Ok(())
    }
}

/// Last reload recorded by the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvLoadLog {
    pub date: u16,
    pub time: u16,
    pub free: [u8; 2],
    pub kvc: u8,
    pub balance: i32,
    pub amount: i32,
    pub sam_id: u32,
    pub sam_transaction_number: u32,
    pub sv_transaction_number: u16,
}

impl SvLoadLog {
    fn parse(log: &[u8]) -> Self {
        Self {
            date: be_uint(&log[0..2]) as u16,
            free: [log[2], log[4]],
            kvc: log[3],
            balance: be_int(&log[5..8]),
            amount: be_int(&log[8..11]),
            time: be_uint(&log[11..13]) as u16,
            sam_id: be_uint(&log[13..17]),
            sam_transaction_number: be_uint(&log[17..20]),
            sv_transaction_number: be_uint(&log[20..22]) as u16,
        }
    }
}

/// Last debit recorded by the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvDebitLog {
    pub amount: i32,
    pub date: u16,
    pub time: u16,
    pub kvc: u8,
    pub sam_id: u32,
    pub sam_transaction_number: u32,
    pub balance: i32,
    pub sv_transaction_number: u16,
}

impl SvDebitLog {
    fn parse(log: &[u8]) -> Self {
        Self {
            amount: be_int(&log[0..2]),
            date: be_uint(&log[2..4]) as u16,
            time: be_uint(&log[4..6]) as u16,
            kvc: log[6],
            sam_id: be_uint(&log[7..11]),
            sam_transaction_number: be_uint(&log[11..14]),
            balance: be_int(&log[14..17]),
            sv_transaction_number: be_uint(&log[17..19]) as u16,
        }
    }
}

/// Decoded SV Get response, kept for the value-changing command that follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvGetData {
    pub operation: SvOperation,
    pub kvc: u8,
    pub transaction_number: u16,
    pub previous_signature_lo: [u8; 3],
    pub challenge_out: [u8; 2],
    pub balance: i32,
    pub load_log: Option<SvLoadLog>,
    pub debit_log: Option<SvDebitLog>,
    /// The SV Get command and response bytes, needed by the SAM
    pub(crate) command: Vec<u8>,
    pub(crate) response: Vec<u8>,
}

impl SvGetData {
    pub fn parse(
        operation: SvOperation,
        command: Vec<u8>,
        response: Vec<u8>,
    ) -> Result<Self, SessionError> {
        let expected = match operation {
            SvOperation::Reload => SV_GET_RELOAD_LENGTH,
            SvOperation::Debit => SV_GET_DEBIT_LENGTH,
        };
        if response.len() != expected {
            return Err(SessionError::Malformed(format!(
                "SV Get response of {} bytes, expected {}",
                response.len(),
                expected
            )));
        }

        let log = &response[LOG_OFFSET..];
        let (load_log, debit_log) = match operation {
            SvOperation::Reload => (Some(SvLoadLog::parse(&log[..LOAD_LOG_LENGTH])), None),
            SvOperation::Debit => (None, Some(SvDebitLog::parse(&log[..DEBIT_LOG_LENGTH]))),
        };

        Ok(Self {
            operation,
            kvc: response[0],
            transaction_number: be_uint(&response[1..3]) as u16,
            previous_signature_lo: [response[3], response[4], response[5]],
            challenge_out: [response[6], response[7]],
            balance: be_int(&response[8..11]),
            load_log,
            debit_log,
            command,
            response,
        })
    }

    /// Most recent log entry matching the requested operation: (amount, date, time)
    pub fn last_entry(&self) -> Option<(i32, u16, u16)> {
        match self.operation {
            SvOperation::Reload => self.load_log.map(|log| (log.amount, log.date, log.time)),
            SvOperation::Debit => self.debit_log.map(|log| (log.amount, log.date, log.time)),
        }
    }
}

/// Card-side part of an SV Reload: date, free1, KVC, free2, amount, time
pub(crate) fn reload_partial_data(
    kvc: u8,
    amount: i32,
    date: u16,
    time: u16,
    free: [u8; 2],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(10);
    data.extend_from_slice(&date.to_be_bytes());
    data.push(free[0]);
    data.push(kvc);
    data.push(free[1]);
    data.extend(to_be_bytes(amount, 3));
    data.extend_from_slice(&time.to_be_bytes());
    data
}

/// Card-side part of an SV Debit/Undebit: amount, date, time, KVC
pub(crate) fn debit_partial_data(kvc: u8, amount: i32, date: u16, time: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(7);
    data.extend(to_be_bytes(amount, 2));
    data.extend_from_slice(&date.to_be_bytes());
    data.extend_from_slice(&time.to_be_bytes());
    data.push(kvc);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reload_get_response() -> Vec<u8> {
        let mut response = vec![
            0x79, // KVC
            0x00, 0x2A, // SV transaction number
            0xA1, 0xA2, 0xA3, // previous signature lo
            0xC1, 0xC2, // challenge out
            0x00, 0x01, 0xF4, // balance 500
        ];
        response.extend_from_slice(&[
            0x12, 0x34, // date
            0xF1, 0x79, 0xF2, // free1, KVC, free2
            0x00, 0x01, 0xF4, // balance
            0x00, 0x00, 0x64, // amount 100
            0x05, 0x06, // time
            0xDE, 0xAD, 0xBE, 0xEF, // SAM id
            0x00, 0x00, 0x07, // SAM transaction number
            0x00, 0x29, // SV transaction number
        ]);
        response
    }

    #[test]
    fn test_parse_reload_get() {
        let command = vec![0x00, 0x7C, 0x00, 0x07, 0x00];
        let data = SvGetData::parse(SvOperation::Reload, command, reload_get_response()).unwrap();
        assert_eq!(data.kvc, 0x79);
        assert_eq!(data.transaction_number, 0x2A);
        assert_eq!(data.balance, 500);
        let log = data.load_log.unwrap();
        assert_eq!(log.amount, 100);
        assert_eq!(log.sam_id, 0xDEADBEEF);
        assert_eq!(log.free, [0xF1, 0xF2]);
        assert_eq!(data.last_entry(), Some((100, 0x1234, 0x0506)));
        assert!(data.debit_log.is_none());
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let err = SvGetData::parse(SvOperation::Debit, vec![], reload_get_response()).unwrap_err();
        assert!(matches!(err, SessionError::Malformed(_)));
    }

    #[test]
    fn test_policy_amount_ranges() {
        let policy = SvPolicy::default();
        assert!(policy.check(SvAction::Reload, 0, RELOAD_AMOUNT_MAX).is_ok());
        assert!(matches!(
            policy.check(SvAction::Debit, 100_000, 40_000),
            Err(SessionError::SvAmountOutOfRange { max: 32_767, .. })
        ));
        assert!(matches!(
            policy.check(SvAction::Undebit, 0, -1),
            Err(SessionError::SvAmountOutOfRange { .. })
        ));
    }

    #[test]
    fn test_policy_negative_floor() {
        let strict = SvPolicy::default();
        assert!(matches!(
            strict.check(SvAction::Debit, 50, 51),
            Err(SessionError::SvNegativeBalance { balance: -1, floor: 0 })
        ));
        assert!(strict.check(SvAction::Debit, 50, 50).is_ok());

        let lenient = SvPolicy { negative_balance_floor: -100 };
        assert!(lenient.check(SvAction::Debit, 50, 150).is_ok());
        assert!(lenient.check(SvAction::Reload, 0, -101).is_err());
    }

    #[test]
    fn test_partial_data_layouts() {
        assert_eq!(
            reload_partial_data(0x79, -2, 0x0102, 0x0304, [0xAA, 0xBB]),
            vec![0x01, 0x02, 0xAA, 0x79, 0xBB, 0xFF, 0xFF, 0xFE, 0x03, 0x04]
        );
        assert_eq!(
            debit_partial_data(0x79, 300, 0x0102, 0x0304),
            vec![0x01, 0x2C, 0x01, 0x02, 0x03, 0x04, 0x79]
        );
    }
}
