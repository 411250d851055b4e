//! Hardware-dependent integration tests
//!
//! These tests require a PC/SC reader with a Calypso card, and for the
//! session test a second reader holding a SAM whose name is given in
//! `CALYPSO_SAM_READER`. They are ignored by default and must be explicitly run with:
//!
//!     cargo test --package calypso-card --test hardware_integration -- --ignored
//!
//! Or to run all tests including hardware tests:
//!
//!     cargo test --package calypso-card --test hardware_integration -- --include-ignored

use std::ffi::CString;

use calypso_card::apdu::commands;
use calypso_card::identity::{CardIdentity, SelectionResponse};
use calypso_card::reader::{CardReader, PcscReader, Reader};
use calypso_card::sam::CalypsoSam;
use calypso_card::session::{PoCommand, RatificationPolicy, SecureSession, TransactionSettings};
use calypso_card::AccessLevel;

/// Calypso application DF name "1TIC.ICA"
const CALYPSO_AID: &[u8] = &[0x31, 0x54, 0x49, 0x43, 0x2E, 0x49, 0x43, 0x41];

fn select_and_decode(card: &mut PcscReader) -> CardIdentity {
    let atr = card.atr().expect("Failed to read ATR");
    let response = commands::select(CALYPSO_AID).send(card).ok();
    let selection = SelectionResponse::from_parts(atr, response.as_ref());
    CardIdentity::decode(&selection).expect("Failed to decode card identity")
}

/// Test that we can connect to a card reader
///
/// **Requires**: Card reader connected (card not required)
#[test]
#[ignore = "requires hardware: card reader"]
fn test_connect_to_reader() {
    let reader = CardReader::new().expect("Failed to establish PC/SC context");
    let readers = reader.list_readers().expect("Failed to list readers");
    assert!(!readers.is_empty(), "No reader found. Is a reader connected?");
}

/// Test that we can detect an inserted card
///
/// **Requires**: Card reader with card inserted
#[test]
#[ignore = "requires hardware: card inserted in reader"]
fn test_card_present() {
    let reader = CardReader::new().expect("Failed to establish PC/SC context");
    let card = reader.connect_first().expect("Failed to connect to card");

    println!("Connected to reader: {}", card.name());
    assert!(card.is_card_present());
}

/// Test selecting the Calypso application and decoding its identity
///
/// **Requires**: Calypso card inserted
#[test]
#[ignore = "requires hardware: Calypso card"]
fn test_select_and_decode_identity() {
    let reader = CardReader::new().expect("Failed to establish PC/SC context");
    let mut card = reader.connect_first().expect("Failed to connect to card");

    let identity = select_and_decode(&mut card);
    println!("Revision: {:?}", identity.revision());
    println!("Serial number: {}", identity.serial_number_hex());
    println!("DF name: {}", identity.df_name_hex());
    println!("Startup info: {}", identity.startup_info_hex());
    println!(
        "Session modifications: {} {:?}",
        identity.modification_counter_max(),
        identity.modification_counter_unit()
    );

    assert_ne!(identity.serial_number(), &[0u8; 8]);
}

/// Full session: open with a bundled read, read the environment, close
///
/// **Requires**: Calypso card in the first reader, SAM in `CALYPSO_SAM_READER`
#[test]
#[ignore = "requires hardware: Calypso card and SAM"]
fn test_secure_session_with_sam() {
    let sam_reader_name = std::env::var("CALYPSO_SAM_READER").expect("CALYPSO_SAM_READER not set");
    let reader = CardReader::new().expect("Failed to establish PC/SC context");
    let sam_name = CString::new(sam_reader_name).expect("Reader name contains a NUL byte");
    let sam_reader = reader.connect(&sam_name).expect("Failed to connect to SAM");
    let mut card = reader.connect_first().expect("Failed to connect to card");

    let identity = select_and_decode(&mut card);
    let mut sam = CalypsoSam::new(sam_reader);
    let mut session =
        SecureSession::new(&mut card, &mut sam, &identity, TransactionSettings::default());

    let initial = session
        .process_opening(AccessLevel::Debit, &[(0x07, 1)])
        .expect("Failed to open secure session");
    println!("Environment: {:?}", initial);

    let results = session
        .process_commands_in_session(&[PoCommand::read_record(0x08, 1)])
        .expect("Failed to read event log");
    println!("Event log: {:?}", results);

    session
        .process_closing(RatificationPolicy::Explicit)
        .expect("Failed to close secure session");
    assert!(session.is_successful().unwrap());
}
