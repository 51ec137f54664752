//! Smoke Screen Unit tests for the energy account ledger components
//!
//! These tests span the codebase and check each transition rule in isolation
//! from the multi-party scenarios. Every rule is exercised with the smallest
//! account that breaks it.
//!

use chrono::NaiveDate;
use std::collections::BTreeSet;

use energy_account::{
    account::{ACCOUNT_HRP, AccountId, AccountRecord, Amount, BirthDate, CustomerDetails, TimeStamp},
    contract::{Command, Transition, verify},
    error::ValidationError,
    party::{Identity, PublicKey, Role},
    utils::new_uuid_to_bech32,
};

struct Fixture {
    regulator: Identity,
    supplier: Identity,
    other: Identity,
    account: AccountRecord,
}

fn fixture() -> Fixture {
    let regulator = Identity::from_seed("Government Regulator", Role::Regulator, [1u8; 32]);
    let supplier = Identity::from_seed("British Energy", Role::Supplier, [2u8; 32]);
    let other = Identity::from_seed("UK Power", Role::Supplier, [3u8; 32]);
    let account = AccountRecord::new(
        AccountId::from("acct1test"),
        regulator.party().clone(),
        supplier.party().clone(),
        alice(),
    );
    Fixture {
        regulator,
        supplier,
        other,
        account,
    }
}

fn alice() -> CustomerDetails {
    CustomerDetails::new(
        "Alice",
        "Anderson",
        BirthDate::new(1980, 1, 1).unwrap(),
        "1 London Wall",
    )
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
}

fn signed_by(identities: &[&Identity]) -> BTreeSet<PublicKey> {
    identities.iter().map(|identity| identity.key()).collect()
}

fn check(
    command: Command,
    inputs: &[AccountRecord],
    outputs: &[AccountRecord],
    signers: &BTreeSet<PublicKey>,
) -> Result<(), ValidationError> {
    verify(command, inputs, outputs, signers, today())
}

// UTILS MODULE TESTS
#[cfg(test)]
mod utils_tests {
    use super::*;

    /// Account ids carry the account prefix and are unique
    #[test]
    fn generates_unique_account_ids() {
        let first = AccountId::generate().unwrap();
        let second = AccountId::generate().unwrap();

        assert!(first.as_str().starts_with(&format!("{ACCOUNT_HRP}1")));
        assert_ne!(first, second);
    }

    /// Empty prefixes are not valid bech32
    #[test]
    fn handles_empty_hrp() {
        assert!(new_uuid_to_bech32("").is_err());
    }
}

// CREATE RULES
#[cfg(test)]
mod create_tests {
    use super::*;

    #[test]
    fn accepts_new_account_signed_by_both() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);

        assert_eq!(check(Command::Create, &[], &[f.account], &signers), Ok(()));
    }

    #[test]
    fn rejects_consumed_inputs() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);

        assert_eq!(
            check(Command::Create, &[f.account.clone()], &[f.account], &signers),
            Err(ValidationError::InputsConsumed)
        );
    }

    #[test]
    fn rejects_blank_names_and_address() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);

        let mut nameless = alice();
        nameless.last_name = "   ".into();
        assert_eq!(
            check(Command::Create, &[], &[f.account.with_customer(nameless)], &signers),
            Err(ValidationError::NameMissing)
        );

        let mut homeless = alice();
        homeless.address = String::new();
        assert_eq!(
            check(Command::Create, &[], &[f.account.with_customer(homeless)], &signers),
            Err(ValidationError::AddressMissing)
        );
    }

    #[test]
    fn rejects_customers_outside_age_range() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);

        for date_of_birth in [(2006, 6, 16), (1894, 6, 15), (2030, 1, 1)] {
            let (y, m, d) = date_of_birth;
            let mut customer = alice();
            customer.date_of_birth = BirthDate::new(y, m, d).unwrap();
            assert_eq!(
                check(Command::Create, &[], &[f.account.with_customer(customer)], &signers),
                Err(ValidationError::InvalidDateOfBirth)
            );
        }
    }

    #[test]
    fn rejects_missing_signatures() {
        let f = fixture();

        assert_eq!(
            check(Command::Create, &[], &[f.account.clone()], &signed_by(&[&f.regulator])),
            Err(ValidationError::ParticipantsNotSigned)
        );
        assert_eq!(
            check(Command::Create, &[], &[f.account], &signed_by(&[&f.supplier])),
            Err(ValidationError::RegulatorNotSigned)
        );
    }

    #[test]
    fn rejects_prefilled_history() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);

        assert_eq!(
            check(Command::Create, &[], &[f.account.with_new_reading(5, None)], &signers),
            Err(ValidationError::MeterReadingsPresent)
        );
        let billed = f
            .account
            .with_new_billing_entry("Opening", Amount::from_minor(100), None)
            .unwrap();
        assert_eq!(
            check(Command::Create, &[], &[billed], &signers),
            Err(ValidationError::BillingEntriesPresent)
        );
    }
}

// MODIFY RULES
#[cfg(test)]
mod modify_tests {
    use super::*;

    #[test]
    fn accepts_new_customer_details() {
        let f = fixture();
        let transition = Transition::modify(&f.account, alice().set_email("alice@example.com"));

        assert_eq!(transition.verify(), Ok(()));
    }

    #[test]
    fn requires_exactly_one_input_and_output() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);
        let a = f.account.clone();

        assert_eq!(
            check(Command::Modify, &[a.clone()], &[], &signers),
            Err(ValidationError::SingleOutputRequired)
        );
        assert_eq!(
            check(Command::Modify, &[a.clone(), a.clone()], &[a], &signers),
            Err(ValidationError::SingleInputRequired)
        );
    }

    #[test]
    fn rejects_supplier_or_regulator_change() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier, &f.other]);

        let moved = f.account.with_supplier(f.other.party().clone());
        assert_eq!(
            check(Command::Modify, &[f.account.clone()], &[moved], &signers),
            Err(ValidationError::SupplierChanged)
        );

        let regulated = f.account.with_regulator(f.other.party().clone());
        assert_eq!(
            check(Command::Modify, &[f.account.clone()], &[regulated], &signers),
            Err(ValidationError::RegulatorChanged)
        );

        let renumbered = f.account.with_id(AccountId::from("acct1other"));
        assert_eq!(
            check(Command::Modify, &[f.account], &[renumbered], &signers),
            Err(ValidationError::AccountIdChanged)
        );
    }

    #[test]
    fn rejects_history_change() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);

        assert_eq!(
            check(Command::Modify, &[f.account.clone()], &[f.account.with_new_reading(1, None)], &signers),
            Err(ValidationError::MeterReadingsChanged)
        );
    }
}

// TRANSFER RULES
#[cfg(test)]
mod transfer_tests {
    use super::*;

    #[test]
    fn accepts_transfer_signed_by_all_three() {
        let f = fixture();
        let transition = Transition::transfer(&f.account, f.other.party().clone());

        assert_eq!(transition.signer_keys().len(), 3);
        assert_eq!(transition.verify(), Ok(()));
    }

    #[test]
    fn rejects_transfer_to_same_supplier() {
        let f = fixture();
        let transition = Transition::transfer(&f.account, f.supplier.party().clone());

        assert_eq!(transition.verify(), Err(ValidationError::SupplierUnchanged));
    }

    #[test]
    fn requires_both_suppliers_to_sign() {
        let f = fixture();
        let output = f.account.with_supplier(f.other.party().clone());

        assert_eq!(
            check(
                Command::Transfer,
                &[f.account.clone()],
                &[output.clone()],
                &signed_by(&[&f.regulator, &f.supplier])
            ),
            Err(ValidationError::ParticipantsNotSigned)
        );
        assert_eq!(
            check(
                Command::Transfer,
                &[f.account],
                &[output],
                &signed_by(&[&f.regulator, &f.other])
            ),
            Err(ValidationError::PreviousSupplierNotSigned)
        );
    }

    #[test]
    fn rejects_customer_change_on_transfer() {
        let f = fixture();
        let output = f
            .account
            .with_supplier(f.other.party().clone())
            .with_customer(alice().set_phone_number("07700 900000"));

        assert_eq!(
            check(
                Command::Transfer,
                &[f.account],
                &[output],
                &signed_by(&[&f.regulator, &f.supplier, &f.other])
            ),
            Err(ValidationError::CustomerChanged)
        );
    }
}

// DELETE RULES
#[cfg(test)]
mod delete_tests {
    use super::*;

    #[test]
    fn accepts_delete() {
        let f = fixture();

        assert_eq!(Transition::delete(&f.account).verify(), Ok(()));
    }

    #[test]
    fn rejects_outputs_and_missing_regulator() {
        let f = fixture();

        assert_eq!(
            check(
                Command::Delete,
                &[f.account.clone()],
                &[f.account.clone()],
                &signed_by(&[&f.regulator, &f.supplier])
            ),
            Err(ValidationError::OutputsCreated)
        );
        assert_eq!(
            check(Command::Delete, &[], &[], &signed_by(&[&f.regulator, &f.supplier])),
            Err(ValidationError::SingleInputRequired)
        );
        assert_eq!(
            check(Command::Delete, &[f.account], &[], &signed_by(&[&f.supplier])),
            Err(ValidationError::RegulatorNotSigned)
        );
    }
}

// METER READ RULES
#[cfg(test)]
mod meter_read_tests {
    use super::*;

    fn at(day: u32) -> Option<TimeStamp<chrono::Utc>> {
        Some(TimeStamp::new_with(2024, 3, day, 9, 0, 0))
    }

    #[test]
    fn first_reading_may_be_any_value() {
        let f = fixture();

        assert_eq!(Transition::meter_read(&f.account, 0, at(1)).verify(), Ok(()));
    }

    #[test]
    fn rejects_readings_going_back_in_time() {
        let f = fixture();
        let read = f.account.with_new_reading(1000, at(2));

        assert_eq!(
            Transition::meter_read(&read, 1001, at(1)).verify(),
            Err(ValidationError::ReadingTimeNotIncreasing)
        );
        assert_eq!(
            Transition::meter_read(&read, 1000, at(3)).verify(),
            Err(ValidationError::ReadingValueNotIncreasing)
        );
    }

    #[test]
    fn rejects_two_readings_at_once() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);
        let twice = f.account.with_new_reading(1, at(1)).with_new_reading(2, at(2));

        assert_eq!(
            check(Command::MeterRead, &[f.account], &[twice], &signers),
            Err(ValidationError::ReadingCountMismatch)
        );
    }

    #[test]
    fn literal_message_names_the_rule() {
        assert_eq!(
            ValidationError::ReadingValueNotIncreasing.to_string(),
            "The value of the new reading must be greater than the previous reading"
        );
    }
}

// BILLING ENTRY RULES
#[cfg(test)]
mod billing_entry_tests {
    use super::*;

    fn at(day: u32) -> Option<TimeStamp<chrono::Utc>> {
        Some(TimeStamp::new_with(2024, 3, day, 9, 0, 0))
    }

    #[test]
    fn accepts_charges_and_credits() {
        let f = fixture();
        let charged = f
            .account
            .with_new_billing_entry("Bill", Amount::from_minor(4500), at(1))
            .unwrap();

        assert_eq!(
            Transition::billing_entry(&charged, "Refund", Amount::from_minor(-500), at(2))
                .unwrap()
                .verify(),
            Ok(())
        );
    }

    #[test]
    fn rejects_entries_going_back_in_time() {
        let f = fixture();
        let charged = f
            .account
            .with_new_billing_entry("Bill", Amount::from_minor(4500), at(2))
            .unwrap();

        assert_eq!(
            Transition::billing_entry(&charged, "Bill", Amount::from_minor(100), at(1))
                .unwrap()
                .verify(),
            Err(ValidationError::EntryTimeNotIncreasing)
        );
    }

    #[test]
    fn rejects_entry_issued_by_another_supplier() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);
        let foreign = f
            .account
            .with_supplier(f.other.party().clone())
            .with_new_billing_entry("Bill", Amount::from_minor(100), at(1))
            .unwrap();
        let output = f.account.with_billing_entries(foreign.billing_entries().to_vec());

        assert_eq!(
            check(Command::BillingEntry, &[f.account], &[output], &signers),
            Err(ValidationError::EntryIssuerMismatch)
        );
    }

    #[test]
    fn rejects_rewritten_billing_history() {
        let f = fixture();
        let signers = signed_by(&[&f.regulator, &f.supplier]);
        let charged = f
            .account
            .with_new_billing_entry("Bill", Amount::from_minor(4500), at(1))
            .unwrap();
        let rewritten = f
            .account
            .with_new_billing_entry("Bill", Amount::from_minor(10), at(1))
            .and_then(|a| a.with_new_billing_entry("Bill", Amount::from_minor(100), at(2)))
            .unwrap();

        assert_eq!(
            check(Command::BillingEntry, &[charged], &[rewritten], &signers),
            Err(ValidationError::BillingHistoryChanged)
        );
    }
}
