//! Secure session engine
//!
//! A [`SecureSession`] drives one transaction against a card and its paired
//! SAM: Open Secure Session, a number of command batches, then Close Secure
//! Session. Every in-session exchange extends the SAM digest, and the outcome
//! is decided by the SAM verifying the card signature, not by status words.
//!
//! Stored Value commands may run inside or outside the session; each
//! Reload/Debit/Undebit consumes the SV Get result that precedes it.

use calypso_common::be_uint;
use calypso_keys::{AccessLevel, KeyTable, KvcPolicy};
use tracing::{debug, info, trace, warn};

use crate::apdu::{commands, ins, ApduCommand, ApduResponse};
use crate::budget::ModificationBudget;
use crate::error::SessionError;
use crate::identity::{CardIdentity, PoRevision};
use crate::reader::Reader;
use crate::sam::SamSession;
use crate::stored_value::{
    debit_partial_data, reload_partial_data, SvAction, SvGetData, SvLogRead, SvOperation, SvPolicy,
};

/// Record length returned by Open Secure Session on revision 1 and 2.4 cards
const REV2_OPEN_RECORD_LENGTH: usize = 29;
const CARD_SIGNATURE_LENGTH: usize = 4;
/// Highest short file identifier
const MAX_SFI: u8 = 30;
/// Highest record Open Secure Session can read
const MAX_OPEN_RECORD: u8 = 31;

/// Kind of card command, used to label rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    OpenSession,
    ReadRecords,
    UpdateRecord,
    WriteRecord,
    AppendRecord,
    Increase,
    Decrease,
    SvGet,
    SvReload,
    SvDebit,
    SvUndebit,
}

/// A prepared command addressed to a file of the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoCommand {
    ReadRecords {
        sfi: u8,
        record_number: u8,
        multiple: bool,
        expected_length: u8,
    },
    UpdateRecord {
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    },
    WriteRecord {
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    },
    AppendRecord {
        sfi: u8,
        data: Vec<u8>,
    },
    Increase {
        sfi: u8,
        counter_number: u8,
        value: u32,
    },
    Decrease {
        sfi: u8,
        counter_number: u8,
        value: u32,
    },
}

impl PoCommand {
    /// Read a single record
    pub fn read_record(sfi: u8, record_number: u8) -> Self {
        PoCommand::ReadRecords {
            sfi,
            record_number,
            multiple: false,
            expected_length: 0,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            PoCommand::ReadRecords { .. } => CommandKind::ReadRecords,
            PoCommand::UpdateRecord { .. } => CommandKind::UpdateRecord,
            PoCommand::WriteRecord { .. } => CommandKind::WriteRecord,
            PoCommand::AppendRecord { .. } => CommandKind::AppendRecord,
            PoCommand::Increase { .. } => CommandKind::Increase,
            PoCommand::Decrease { .. } => CommandKind::Decrease,
        }
    }

    pub fn sfi(&self) -> u8 {
        match self {
            PoCommand::ReadRecords { sfi, .. }
            | PoCommand::UpdateRecord { sfi, .. }
            | PoCommand::WriteRecord { sfi, .. }
            | PoCommand::AppendRecord { sfi, .. }
            | PoCommand::Increase { sfi, .. }
            | PoCommand::Decrease { sfi, .. } => *sfi,
        }
    }

    /// The SFI shares P2 with three flag bits, so it must fit in five bits
    fn check_address(&self) -> Result<(), SessionError> {
        match self.sfi() {
            sfi if sfi > MAX_SFI => Err(SessionError::InvalidFileAddress {
                sfi,
                record_number: match self {
                    PoCommand::ReadRecords { record_number, .. }
                    | PoCommand::UpdateRecord { record_number, .. }
                    | PoCommand::WriteRecord { record_number, .. } => *record_number,
                    _ => 0,
                },
            }),
            _ => Ok(()),
        }
    }

    /// Whether the command alters card memory and counts against the budget
    pub fn is_modifying(&self) -> bool {
        !matches!(self, PoCommand::ReadRecords { .. })
    }

    fn build(&self, cla: u8) -> ApduCommand {
        match self {
            PoCommand::ReadRecords {
                sfi,
                record_number,
                multiple,
                expected_length,
            } => commands::read_records(cla, *sfi, *record_number, *multiple, *expected_length),
            PoCommand::UpdateRecord { sfi, record_number, data } => {
                commands::update_record(cla, *sfi, *record_number, data)
            }
            PoCommand::WriteRecord { sfi, record_number, data } => {
                commands::write_record(cla, *sfi, *record_number, data)
            }
            PoCommand::AppendRecord { sfi, data } => commands::append_record(cla, *sfi, data),
            PoCommand::Increase { sfi, counter_number, value } => {
                commands::increase(cla, *sfi, *counter_number, *value)
            }
            PoCommand::Decrease { sfi, counter_number, value } => {
                commands::decrease(cla, *sfi, *counter_number, *value)
            }
        }
    }

    /// Decode the data of a successful response
    fn decode(&self, data: &[u8]) -> Result<CommandResult, SessionError> {
        match self {
            PoCommand::ReadRecords {
                record_number,
                multiple: false,
                ..
            } => Ok(CommandResult::Records(vec![(*record_number, data.to_vec())])),
            PoCommand::ReadRecords { multiple: true, .. } => {
                decode_multiple_records(data).map(CommandResult::Records)
            }
            PoCommand::Increase { .. } | PoCommand::Decrease { .. } => {
                if data.len() != 3 {
                    let message = format!("counter value of {} bytes", data.len());
                    return Err(SessionError::Malformed(message));
                }
                Ok(CommandResult::Counter(be_uint(data)))
            }
            _ => Ok(CommandResult::Applied),
        }
    }
}

/// Records returned by Read Records in multiple mode: `number length data` repeated
fn decode_multiple_records(mut data: &[u8]) -> Result<Vec<(u8, Vec<u8>)>, SessionError> {
    let mut records = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 || data.len() < 2 + data[1] as usize {
            return Err(SessionError::Malformed("truncated record in Read Records response".into()));
        }
        let length = data[1] as usize;
        records.push((data[0], data[2..2 + length].to_vec()));
        data = &data[2 + length..];
    }
    Ok(records)
}

/// Outcome of one command of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Record number and content of each record read
    Records(Vec<(u8, Vec<u8>)>),
    /// New counter value after Increase/Decrease
    Counter(u32),
    /// Update, Write or Append accepted
    Applied,
    /// The card answered with a non-success status word
    Rejected { status_word: u16 },
    /// Not sent because an earlier command was rejected
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Closed,
    Open,
    Terminated(SessionOutcome),
}

/// How the session is ratified after closing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatificationPolicy {
    /// The card ratifies by itself (next command or deselection)
    #[default]
    Implicit,
    /// A ratification command follows the close (contactless usage)
    Explicit,
}

/// What happens to the rest of a batch after a card rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    StopOnFirstRejection,
    #[default]
    BestEffort,
}

/// Terminal-side settings for a transaction
#[derive(Debug, Clone)]
pub struct TransactionSettings {
    keys: KeyTable,
    kvc_policy: KvcPolicy,
    rejection_policy: RejectionPolicy,
    sv_policy: SvPolicy,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        let keys = KeyTable::embedded();
        let kvc_policy = keys.kvc_policy();
        Self {
            keys,
            kvc_policy,
            rejection_policy: RejectionPolicy::default(),
            sv_policy: SvPolicy::default(),
        }
    }
}

impl TransactionSettings {
    /// Replace the key table; its KVC lines become the KVC policy
    pub fn with_keys(mut self, keys: KeyTable) -> Self {
        self.kvc_policy = keys.kvc_policy();
        self.keys = keys;
        self
    }

    pub fn with_kvc_policy(mut self, policy: KvcPolicy) -> Self {
        self.kvc_policy = policy;
        self
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection_policy = policy;
        self
    }

    pub fn with_sv_policy(mut self, policy: SvPolicy) -> Self {
        self.sv_policy = policy;
        self
    }

    pub fn keys(&self) -> &KeyTable {
        &self.keys
    }

    pub fn kvc_policy(&self) -> &KvcPolicy {
        &self.kvc_policy
    }

    pub fn rejection_policy(&self) -> RejectionPolicy {
        self.rejection_policy
    }

    pub fn sv_policy(&self) -> SvPolicy {
        self.sv_policy
    }
}

/// Mutable state of one secure session
#[derive(Debug, Clone)]
pub struct SessionState {
    phase: SessionPhase,
    access_level: Option<AccessLevel>,
    ratified: Option<bool>,
    budget: ModificationBudget,
    last_error: Option<SessionError>,
    rejections: Vec<SessionError>,
}

impl SessionState {
    fn new(budget: ModificationBudget) -> Self {
        Self {
            phase: SessionPhase::Closed,
            access_level: None,
            ratified: None,
            budget,
            last_error: None,
            rejections: Vec::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn access_level(&self) -> Option<AccessLevel> {
        self.access_level
    }

    /// Whether the previous session on this card was ratified, known after opening
    pub fn ratified(&self) -> Option<bool> {
        self.ratified
    }

    pub fn budget(&self) -> &ModificationBudget {
        &self.budget
    }

    /// First failure of the session
    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Card rejections collected during the session
    pub fn rejections(&self) -> &[SessionError] {
        &self.rejections
    }
}

/// Decoded Open Secure Session response
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenSessionData {
    kif: Option<u8>,
    kvc: u8,
    ratified: bool,
    record_data: Vec<u8>,
}

fn parse_open_response(revision: PoRevision, data: &[u8]) -> Result<OpenSessionData, SessionError> {
    match revision {
        PoRevision::Rev1_0 | PoRevision::Rev2_4 => {
            // KVC, counter(3), random, [record], [ratification(2)]
            let (ratified, record_end) = match data.len() {
                5 => (true, 5),
                7 => (false, 5),
                n if n == 5 + REV2_OPEN_RECORD_LENGTH => (true, n),
                n if n == 7 + REV2_OPEN_RECORD_LENGTH => (false, n - 2),
                n => {
                    return Err(SessionError::Malformed(format!(
                        "open session response of {} bytes",
                        n
                    )))
                }
            };
            Ok(OpenSessionData {
                kif: None,
                kvc: data[0],
                ratified,
                record_data: data[5..record_end].to_vec(),
            })
        }
        _ => {
            // counter(3), random, ratification, KIF, KVC, length, data
            if data.len() < 8 || data.len() != 8 + data[7] as usize {
                return Err(SessionError::Malformed(format!(
                    "open session response of {} bytes",
                    data.len()
                )));
            }
            Ok(OpenSessionData {
                kif: Some(data[5]),
                kvc: data[6],
                ratified: data[4] == 0x00,
                record_data: data[8..].to_vec(),
            })
        }
    }
}

/// Split the Close Secure Session response into postponed data items and the card signature
fn parse_close_response(data: &[u8]) -> Result<(Vec<Vec<u8>>, Vec<u8>), SessionError> {
    if data.len() < CARD_SIGNATURE_LENGTH {
        return Err(SessionError::Malformed(format!(
            "close session response of {} bytes",
            data.len()
        )));
    }
    let (mut postponed, signature) = data.split_at(data.len() - CARD_SIGNATURE_LENGTH);

    let mut items = Vec::new();
    while let Some((&length, rest)) = postponed.split_first() {
        let length = length as usize;
        if rest.len() < length {
            return Err(SessionError::Malformed("truncated postponed data".into()));
        }
        items.push(rest[..length].to_vec());
        postponed = &rest[length..];
    }
    Ok((items, signature.to_vec()))
}

/// One transaction against a card and its SAM
pub struct SecureSession<'a, R: Reader, S: SamSession> {
    reader: R,
    sam: S,
    identity: &'a CardIdentity,
    settings: TransactionSettings,
    state: SessionState,
    last_batch: Vec<CommandResult>,
    sv_get: Option<SvGetData>,
    sv_signature_pending: bool,
}

impl<'a, R: Reader, S: SamSession> SecureSession<'a, R, S> {
    pub fn new(
        reader: R,
        sam: S,
        identity: &'a CardIdentity,
        settings: TransactionSettings,
    ) -> Self {
        let params = identity.session_buffer();
        Self {
            reader,
            sam,
            identity,
            settings,
            state: SessionState::new(ModificationBudget::new(params.unit, params.max)),
            last_batch: Vec::new(),
            sv_get: None,
            sv_signature_pending: false,
        }
    }

    pub fn identity(&self) -> &CardIdentity {
        self.identity
    }

    pub fn settings(&self) -> &TransactionSettings {
        &self.settings
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.state.last_error()
    }

    pub fn was_ratified(&self) -> Option<bool> {
        self.state.ratified
    }

    /// Results of the commands sent by the last batch, including a batch cut short by an overflow
    pub fn last_batch_results(&self) -> &[CommandResult] {
        &self.last_batch
    }

    /// Whether the session terminated successfully; only valid once terminated
    pub fn is_successful(&self) -> Result<bool, SessionError> {
        match self.state.phase {
            SessionPhase::Terminated(outcome) => Ok(outcome == SessionOutcome::Success),
            _ => Err(SessionError::IllegalState("session not terminated")),
        }
    }

    /// Give back the reader and the SAM
    pub fn into_parts(self) -> (R, S) {
        (self.reader, self.sam)
    }

    /// Open the secure session, bundling the first initial read into the open command.
    ///
    /// `initial_reads` are `(sfi, record_number)` pairs; any beyond the first are
    /// read inside the session right after opening.
    pub fn process_opening(
        &mut self,
        access_level: AccessLevel,
        initial_reads: &[(u8, u8)],
    ) -> Result<Vec<CommandResult>, SessionError> {
        if self.state.phase != SessionPhase::Closed {
            return Err(SessionError::IllegalState("session already opened"));
        }

        let revision = self.identity.revision();
        let cla = self.identity.class_byte();
        let (sfi, record_number) = initial_reads.first().copied().unwrap_or((0, 0));
        // Open Secure Session packs the record number into the top five bits of P1
        if sfi > MAX_SFI || record_number > MAX_OPEN_RECORD {
            return Err(SessionError::InvalidFileAddress { sfi, record_number });
        }
        for &(sfi, record_number) in initial_reads.iter().skip(1) {
            PoCommand::read_record(sfi, record_number).check_address()?;
        }

        self.sam
            .select_diversifier(self.identity.serial_number())
            .map_err(|err| self.abort(err))?;
        let challenge = self.sam.get_challenge().map_err(|err| self.abort(err))?;

        let key_index = access_level.key_index();
        let command = match revision {
            PoRevision::Rev1_0 => {
                commands::open_session_rev10(cla, key_index, sfi, record_number, &challenge)
            }
            PoRevision::Rev2_4 => {
                commands::open_session_rev24(cla, key_index, sfi, record_number, &challenge)
            }
            _ => commands::open_session_rev3(cla, key_index, sfi, record_number, &challenge),
        };
        debug!(?revision, ?access_level, sfi, record_number, "opening secure session");

        let (_, response) = self.exchange(&command).map_err(|err| self.abort(err))?;
        if !response.is_success() {
            let err = SessionError::CardCommandRejected {
                command: CommandKind::OpenSession,
                status_word: response.status_word(),
            };
            warn!(sw = %response.status_description(), "open secure session rejected");
            return Err(self.abort(err));
        }

        let open = parse_open_response(revision, &response.data).map_err(|err| self.abort(err))?;

        if !self.settings.kvc_policy.is_authorized(open.kvc) {
            warn!(kvc = open.kvc, "KVC not authorized, session aborted");
            return Err(self.abort(SessionError::UnauthorizedKvc { kvc: open.kvc }));
        }

        let kif = open
            .kif
            .or_else(|| self.settings.keys.key(access_level).map(|key| key.kif));
        self.sam
            .begin_digest(&response.data, kif, open.kvc, access_level)
            .map_err(|err| self.abort(err))?;

        self.state.phase = SessionPhase::Open;
        self.state.access_level = Some(access_level);
        self.state.ratified = Some(open.ratified);
        self.state.budget.reset();
        info!(
            serial_number = %self.identity.serial_number_hex(),
            kvc = open.kvc,
            ratified = open.ratified,
            "secure session opened"
        );

        let mut results = Vec::new();
        if record_number != 0 {
            results.push(CommandResult::Records(vec![(record_number, open.record_data)]));
        }
        if initial_reads.len() > 1 {
            let reads: Vec<PoCommand> = initial_reads[1..]
                .iter()
                .map(|&(sfi, record_number)| PoCommand::read_record(sfi, record_number))
                .collect();
            results.extend(self.process_commands_in_session(&reads)?);
        }
        Ok(results)
    }

    /// Send a batch of commands inside the open session.
    ///
    /// Modifying commands are checked against the budget before being sent; an
    /// overflow stops the batch with [`SessionError::ModificationBufferOverflow`]
    /// and leaves the session open so the applied commands can still be closed.
    pub fn process_commands_in_session(
        &mut self,
        batch: &[PoCommand],
    ) -> Result<Vec<CommandResult>, SessionError> {
        if self.state.phase != SessionPhase::Open {
            return Err(SessionError::IllegalState("no secure session open"));
        }

        for command in batch {
            command.check_address()?;
        }

        let cla = self.identity.class_byte();
        let mut stopped = false;
        self.last_batch.clear();

        for command in batch {
            if stopped {
                self.last_batch.push(CommandResult::Skipped);
                continue;
            }

            let apdu = command.build(cla);
            if command.is_modifying() {
                if let Err(err) = self.state.budget.try_record(apdu.lc()) {
                    warn!(command = ?command.kind(), %err, "modification budget exceeded");
                    return Err(err);
                }
            }

            let (bytes, response) = self.exchange(&apdu).map_err(|err| self.abort(err))?;
            self.sam
                .update_digest(&bytes, &response.to_bytes())
                .map_err(|err| self.abort(err))?;

            if !response.is_success() {
                self.reject(command.kind(), &response);
                self.last_batch.push(CommandResult::Rejected {
                    status_word: response.status_word(),
                });
                stopped = self.settings.rejection_policy == RejectionPolicy::StopOnFirstRejection;
                continue;
            }

            let result = command.decode(&response.data).map_err(|err| self.abort(err))?;
            self.last_batch.push(result);
        }

        debug!(
            commands = batch.len(),
            budget_used = self.state.budget.used(),
            budget_max = self.state.budget.max(),
            "batch processed"
        );
        Ok(self.last_batch.clone())
    }

    /// Close the session and decide its outcome.
    ///
    /// Success requires the close to be accepted, the SAM to verify the card
    /// signature and no card rejection during the session.
    pub fn process_closing(
        &mut self,
        ratification: RatificationPolicy,
    ) -> Result<(), SessionError> {
        if self.state.phase != SessionPhase::Open {
            return Err(SessionError::IllegalState("no secure session open"));
        }

        let cla = self.identity.class_byte();
        let mac = self.sam.finalize_digest_and_mac().map_err(|err| self.abort(err))?;

        let explicit = ratification == RatificationPolicy::Explicit;
        let close = commands::close_session(cla, explicit, &mac);
        let (_, response) = self.exchange(&close).map_err(|err| self.abort(err))?;
        if !response.is_success() {
            warn!(sw = %response.status_description(), "close secure session rejected");
            return Err(self.abort(SessionError::CloseRejected(response.status_word())));
        }
        let (postponed, signature) =
            parse_close_response(&response.data).map_err(|err| self.abort(err))?;

        if explicit {
            // The card answers with an error status by construction
            match self.exchange(&commands::ratification(cla)) {
                Ok((_, response)) => trace!(sw = %response.status_string(), "ratification sent"),
                Err(err) => debug!(%err, "ratification exchange failed"),
            }
        }

        let verified = self.sam.verify_mac(&signature).map_err(|err| self.abort(err))?;
        if !verified {
            warn!(
                signature = %hex::encode_upper(&signature),
                "card session signature not verified"
            );
            return Err(self.abort(SessionError::SessionMacVerificationFailed));
        }

        if self.sv_signature_pending {
            self.sv_signature_pending = false;
            let sv_signature = postponed
                .first()
                .ok_or_else(|| {
                    SessionError::Malformed("SV signature missing from postponed data".into())
                })
                .map_err(|err| self.abort(err))?;
            let checked = self.sam.sv_check(sv_signature).map_err(|err| self.abort(err))?;
            if !checked {
                warn!("postponed SV signature rejected");
                return Err(self.abort(SessionError::SvSignatureRejected));
            }
        }

        if let Some(err) = self.state.last_error.clone() {
            self.state.phase = SessionPhase::Terminated(SessionOutcome::Failure);
            info!(
                rejections = self.state.rejections.len(),
                "secure session closed with rejected commands"
            );
            return Err(err);
        }

        self.state.phase = SessionPhase::Terminated(SessionOutcome::Success);
        info!("secure session closed");
        Ok(())
    }

    /// Read the SV balance and last log(s), caching the result for the next SV command
    pub fn sv_get(
        &mut self,
        operation: SvOperation,
        log_read: SvLogRead,
    ) -> Result<SvGetData, SessionError> {
        self.require_stored_value()?;

        let other_log = if log_read == SvLogRead::All {
            let other = match operation {
                SvOperation::Reload => SvOperation::Debit,
                SvOperation::Debit => SvOperation::Reload,
            };
            Some(self.exchange_sv_get(other)?)
        } else {
            None
        };

        let mut data = self.exchange_sv_get(operation)?;
        if let Some(other) = other_log {
            data.load_log = data.load_log.or(other.load_log);
            data.debit_log = data.debit_log.or(other.debit_log);
        }

        debug!(?operation, balance = data.balance, "SV get");
        self.sv_get = Some(data.clone());
        Ok(data)
    }

    /// Reload (or, with a negative amount, reduce) the SV balance
    pub fn sv_reload(
        &mut self,
        amount: i32,
        date: u16,
        time: u16,
        free: [u8; 2],
    ) -> Result<(), SessionError> {
        self.sv_modify(SvAction::Reload, amount, |kvc| {
            reload_partial_data(kvc, amount, date, time, free)
        })
    }

    pub fn sv_debit(&mut self, amount: i32, date: u16, time: u16) -> Result<(), SessionError> {
        self.sv_modify(SvAction::Debit, amount, |kvc| debit_partial_data(kvc, amount, date, time))
    }

    /// Cancel a previous debit
    pub fn sv_undebit(&mut self, amount: i32, date: u16, time: u16) -> Result<(), SessionError> {
        self.sv_modify(SvAction::Undebit, amount, |kvc| debit_partial_data(kvc, amount, date, time))
    }

    fn exchange_sv_get(&mut self, operation: SvOperation) -> Result<SvGetData, SessionError> {
        let reload = operation == SvOperation::Reload;
        let command = commands::sv_get(self.identity.class_byte(), reload);
        let (bytes, response) = self.sv_exchange(&command)?;
        if !response.is_success() {
            return Err(self.reject(CommandKind::SvGet, &response));
        }
        SvGetData::parse(operation, bytes, response.data).map_err(|err| self.sv_abort(err))
    }

    fn sv_modify(
        &mut self,
        action: SvAction,
        amount: i32,
        partial: impl FnOnce(u8) -> Vec<u8>,
    ) -> Result<(), SessionError> {
        self.require_stored_value()?;
        if self.sv_signature_pending {
            return Err(SessionError::IllegalState("only one SV operation per secure session"));
        }

        let balance = match &self.sv_get {
            Some(get) if get.operation == action.operation() => get.balance,
            _ => return Err(SessionError::SvOrdering(action.operation())),
        };
        self.settings.sv_policy.check(action, balance, amount)?;
        let get = self
            .sv_get
            .take()
            .ok_or(SessionError::SvOrdering(action.operation()))?;

        let partial = partial(get.kvc);
        let complementary = self
            .sam
            .sv_prepare(action, &get.command, &get.response, &partial)
            .map_err(|err| self.sv_abort(err))?;

        let (instruction, kind) = match action {
            SvAction::Reload => (ins::SV_RELOAD, CommandKind::SvReload),
            SvAction::Debit => (ins::SV_DEBIT, CommandKind::SvDebit),
            SvAction::Undebit => (ins::SV_UNDEBIT, CommandKind::SvUndebit),
        };
        let mut data = partial;
        data.extend(complementary);
        let command = commands::sv_operation(self.identity.class_byte(), instruction, data);

        let (_, response) = self.sv_exchange(&command)?;
        if !response.is_success() {
            return Err(self.reject(kind, &response));
        }

        if self.state.phase == SessionPhase::Open {
            // Signature comes back as postponed data at close
            self.sv_signature_pending = true;
        } else {
            let checked = self.sam.sv_check(&response.data)?;
            if !checked {
                warn!(?action, "SV signature rejected");
                return Err(SessionError::SvSignatureRejected);
            }
        }
        info!(?action, amount, previous_balance = balance, "SV operation done");
        Ok(())
    }

    fn require_stored_value(&self) -> Result<(), SessionError> {
        if matches!(self.state.phase, SessionPhase::Terminated(_)) {
            return Err(SessionError::IllegalState("session terminated"));
        }
        if !self.identity.is_stored_value_available() {
            return Err(SessionError::IllegalState("stored value not available on this card"));
        }
        Ok(())
    }

    /// SV exchange, digested when a session is open
    fn sv_exchange(
        &mut self,
        command: &ApduCommand,
    ) -> Result<(Vec<u8>, ApduResponse), SessionError> {
        let (bytes, response) = self.exchange(command).map_err(|err| self.sv_abort(err))?;
        if self.state.phase == SessionPhase::Open {
            self.sam
                .update_digest(&bytes, &response.to_bytes())
                .map_err(|err| self.abort(err))?;
        }
        Ok((bytes, response))
    }

    fn exchange(&mut self, command: &ApduCommand) -> Result<(Vec<u8>, ApduResponse), SessionError> {
        let bytes = command.build();
        let response = self.reader.transmit(&bytes)?;
        trace!(
            command = %hex::encode_upper(&bytes),
            response = %hex::encode_upper(response.to_bytes()),
            "card exchange"
        );
        Ok((bytes, response))
    }

    /// Record a card rejection; inside a session it fails the close later
    fn reject(&mut self, command: CommandKind, response: &ApduResponse) -> SessionError {
        let err = SessionError::CardCommandRejected {
            command,
            status_word: response.status_word(),
        };
        warn!(?command, sw = %response.status_description(), "card rejected command");
        if self.state.phase == SessionPhase::Open {
            self.state.rejections.push(err.clone());
            self.record_error(err.clone());
        }
        err
    }

    /// Terminate the session as failed
    fn abort(&mut self, err: SessionError) -> SessionError {
        self.record_error(err.clone());
        self.state.phase = SessionPhase::Terminated(SessionOutcome::Failure);
        err
    }

    /// Outside a session there is nothing to terminate
    fn sv_abort(&mut self, err: SessionError) -> SessionError {
        if self.state.phase == SessionPhase::Open {
            self.abort(err)
        } else {
            err
        }
    }

    fn record_error(&mut self, err: SessionError) {
        if self.state.last_error.is_none() {
            self.state.last_error = Some(err);
        }
    }
}
