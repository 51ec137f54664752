//! Transition validation: decides whether a proposed account version is a legal
//! successor of the current one.
//!
//! Every party runs the same checks independently before counter-signing, so
//! everything here is a pure function of its arguments. Checks run in a fixed
//! order and the first violated rule is returned.
use chrono::{Months, NaiveDate, Utc};
use std::collections::BTreeSet;

use crate::account::{AccountRecord, Amount, CustomerDetails, TimeStamp};
use crate::error::{AmountOverflow, ValidationError};
use crate::party::{Party, PublicKey};

const MINIMUM_AGE_YEARS: u32 = 18;
const MAXIMUM_AGE_YEARS: u32 = 130;

/// The operation a transition performs.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    #[n(0)]
    Create,
    #[n(1)]
    Modify,
    #[n(2)]
    Transfer,
    #[n(3)]
    Delete,
    #[n(4)]
    MeterRead,
    #[n(5)]
    BillingEntry,
}

/// A proposed move from the consumed versions to the produced versions, with
/// the parties whose signatures it declares as mandatory.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    #[n(0)]
    pub command: Command,
    #[n(1)]
    pub inputs: Vec<AccountRecord>,
    #[n(2)]
    pub outputs: Vec<AccountRecord>,
    #[n(3)]
    pub signers: Vec<Party>,
    #[n(4)]
    pub proposed_at: TimeStamp<Utc>, // fixes the date used for age checks
}

impl Transition {
    fn new(
        command: Command,
        input: Option<&AccountRecord>,
        output: Option<AccountRecord>,
        signers: Vec<Party>,
    ) -> Self {
        Self {
            command,
            inputs: input.into_iter().cloned().collect(),
            outputs: output.into_iter().collect(),
            signers,
            proposed_at: TimeStamp::new(),
        }
    }

    pub fn create(regulator: Party, supplier: Party, customer: CustomerDetails) -> anyhow::Result<Self> {
        let account = AccountRecord::open(regulator.clone(), supplier.clone(), customer)?;
        Ok(Self::new(
            Command::Create,
            None,
            Some(account),
            vec![regulator, supplier],
        ))
    }
    pub fn modify(account: &AccountRecord, customer: CustomerDetails) -> Self {
        Self::new(
            Command::Modify,
            Some(account),
            Some(account.with_customer(customer)),
            vec![account.regulator().clone(), account.supplier().clone()],
        )
    }
    pub fn transfer(account: &AccountRecord, new_supplier: Party) -> Self {
        Self::new(
            Command::Transfer,
            Some(account),
            Some(account.with_supplier(new_supplier.clone())),
            vec![
                account.regulator().clone(),
                account.supplier().clone(),
                new_supplier,
            ],
        )
    }
    pub fn delete(account: &AccountRecord) -> Self {
        Self::new(
            Command::Delete,
            Some(account),
            None,
            vec![account.regulator().clone(), account.supplier().clone()],
        )
    }
    pub fn meter_read(account: &AccountRecord, units: u64, timestamp: Option<TimeStamp<Utc>>) -> Self {
        Self::new(
            Command::MeterRead,
            Some(account),
            Some(account.with_new_reading(units, timestamp)),
            vec![account.regulator().clone(), account.supplier().clone()],
        )
    }
    pub fn billing_entry(
        account: &AccountRecord,
        description: impl Into<String>,
        amount: Amount,
        timestamp: Option<TimeStamp<Utc>>,
    ) -> Result<Self, AmountOverflow> {
        Ok(Self::new(
            Command::BillingEntry,
            Some(account),
            Some(account.with_new_billing_entry(description, amount, timestamp)?),
            vec![account.regulator().clone(), account.supplier().clone()],
        ))
    }

    pub fn input(&self) -> Option<&AccountRecord> {
        self.inputs.first()
    }
    pub fn output(&self) -> Option<&AccountRecord> {
        self.outputs.first()
    }
    pub fn signer_keys(&self) -> BTreeSet<PublicKey> {
        self.signers.iter().map(|party| party.key).collect()
    }
    /// Runs the ledger rules against the declared signers as of the proposal date.
    pub fn verify(&self) -> Result<(), ValidationError> {
        verify(
            self.command,
            &self.inputs,
            &self.outputs,
            &self.signer_keys(),
            self.proposed_at.date(),
        )
    }
}

/// Validates one prior version against one proposed version as of today.
pub fn validate(
    command: Command,
    prior: Option<&AccountRecord>,
    proposed: Option<&AccountRecord>,
    signers: &BTreeSet<PublicKey>,
) -> Result<(), ValidationError> {
    let inputs: Vec<AccountRecord> = prior.into_iter().cloned().collect();
    let outputs: Vec<AccountRecord> = proposed.into_iter().cloned().collect();
    verify(command, &inputs, &outputs, signers, Utc::now().date_naive())
}

/// Validates a transition consuming `inputs` and producing `outputs`.
pub fn verify(
    command: Command,
    inputs: &[AccountRecord],
    outputs: &[AccountRecord],
    signers: &BTreeSet<PublicKey>,
    today: NaiveDate,
) -> Result<(), ValidationError> {
    match command {
        Command::Create => verify_create(inputs, outputs, signers, today),
        Command::Modify => verify_modify(inputs, outputs, signers, today),
        Command::Transfer => verify_transfer(inputs, outputs, signers),
        Command::Delete => verify_delete(inputs, outputs, signers),
        Command::MeterRead => verify_meter_read(inputs, outputs, signers),
        Command::BillingEntry => verify_billing_entry(inputs, outputs, signers),
    }
}

fn require(condition: bool, violation: ValidationError) -> Result<(), ValidationError> {
    if condition { Ok(()) } else { Err(violation) }
}

// exactly one input and one output, checked before any content is read
fn single_in_single_out<'a>(
    inputs: &'a [AccountRecord],
    outputs: &'a [AccountRecord],
) -> Result<(&'a AccountRecord, &'a AccountRecord), ValidationError> {
    match (inputs, outputs) {
        ([input], [output]) => Ok((input, output)),
        ([_], _) => Err(ValidationError::SingleOutputRequired),
        _ => Err(ValidationError::SingleInputRequired),
    }
}

fn participants_signed(account: &AccountRecord, signers: &BTreeSet<PublicKey>) -> Result<(), ValidationError> {
    require(
        account
            .participants()
            .iter()
            .all(|party| signers.contains(&party.key)),
        ValidationError::ParticipantsNotSigned,
    )?;
    require(
        signers.contains(&account.regulator().key),
        ValidationError::RegulatorNotSigned,
    )
}

fn same_lineage(input: &AccountRecord, output: &AccountRecord) -> Result<(), ValidationError> {
    require(input.id() == output.id(), ValidationError::AccountIdChanged)?;
    require(
        input.regulator() == output.regulator(),
        ValidationError::RegulatorChanged,
    )
}

fn same_supplier(input: &AccountRecord, output: &AccountRecord) -> Result<(), ValidationError> {
    require(
        input.supplier().key == output.supplier().key,
        ValidationError::SupplierChanged,
    )
}

fn validate_mandatory_fields(account: &AccountRecord, today: NaiveDate) -> Result<(), ValidationError> {
    let customer = account.customer();
    require(
        !customer.first_name.trim().is_empty() && !customer.last_name.trim().is_empty(),
        ValidationError::NameMissing,
    )?;
    require(
        age_is_valid(customer.date_of_birth.to_naive_date(), today),
        ValidationError::InvalidDateOfBirth,
    )?;
    require(
        !customer.address.trim().is_empty(),
        ValidationError::AddressMissing,
    )
}

// age in [18, 130) years on `today`
fn age_is_valid(date_of_birth: NaiveDate, today: NaiveDate) -> bool {
    let youngest = today.checked_sub_months(Months::new(MINIMUM_AGE_YEARS * 12));
    let oldest = today.checked_sub_months(Months::new(MAXIMUM_AGE_YEARS * 12));

    match (youngest, oldest) {
        (Some(youngest), Some(oldest)) => date_of_birth <= youngest && date_of_birth > oldest,
        _ => false,
    }
}

fn verify_create(
    inputs: &[AccountRecord],
    outputs: &[AccountRecord],
    signers: &BTreeSet<PublicKey>,
    today: NaiveDate,
) -> Result<(), ValidationError> {
    require(inputs.is_empty(), ValidationError::InputsConsumed)?;
    let [output] = outputs else {
        return Err(ValidationError::SingleOutputRequired);
    };

    validate_mandatory_fields(output, today)?;
    participants_signed(output, signers)?;
    require(
        output.meter_readings().is_empty(),
        ValidationError::MeterReadingsPresent,
    )?;
    require(
        output.billing_entries().is_empty(),
        ValidationError::BillingEntriesPresent,
    )
}

fn verify_modify(
    inputs: &[AccountRecord],
    outputs: &[AccountRecord],
    signers: &BTreeSet<PublicKey>,
    today: NaiveDate,
) -> Result<(), ValidationError> {
    let (input, output) = single_in_single_out(inputs, outputs)?;

    validate_mandatory_fields(output, today)?;
    same_lineage(input, output)?;
    same_supplier(input, output)?;
    require(
        input.meter_readings() == output.meter_readings(),
        ValidationError::MeterReadingsChanged,
    )?;
    require(
        input.billing_entries() == output.billing_entries(),
        ValidationError::BillingHistoryChanged,
    )?;
    participants_signed(output, signers)
}

fn verify_transfer(
    inputs: &[AccountRecord],
    outputs: &[AccountRecord],
    signers: &BTreeSet<PublicKey>,
) -> Result<(), ValidationError> {
    let (input, output) = single_in_single_out(inputs, outputs)?;

    same_lineage(input, output)?;
    require(
        input.supplier().key != output.supplier().key,
        ValidationError::SupplierUnchanged,
    )?;
    participants_signed(output, signers)?;
    require(
        signers.contains(&input.supplier().key),
        ValidationError::PreviousSupplierNotSigned,
    )?;
    require(
        input.customer() == output.customer(),
        ValidationError::CustomerChanged,
    )?;
    require(
        input.meter_readings() == output.meter_readings(),
        ValidationError::MeterReadingsChanged,
    )?;
    require(
        input.billing_entries() == output.billing_entries(),
        ValidationError::BillingHistoryChanged,
    )
}

fn verify_delete(
    inputs: &[AccountRecord],
    outputs: &[AccountRecord],
    signers: &BTreeSet<PublicKey>,
) -> Result<(), ValidationError> {
    require(outputs.is_empty(), ValidationError::OutputsCreated)?;
    let [input] = inputs else {
        return Err(ValidationError::SingleInputRequired);
    };

    participants_signed(input, signers)
}

// shared by the two history-extending operations
fn same_account_details(
    input: &AccountRecord,
    output: &AccountRecord,
    signers: &BTreeSet<PublicKey>,
) -> Result<(), ValidationError> {
    same_lineage(input, output)?;
    same_supplier(input, output)?;
    require(
        input.customer() == output.customer(),
        ValidationError::CustomerChanged,
    )?;
    participants_signed(output, signers)
}

fn verify_meter_read(
    inputs: &[AccountRecord],
    outputs: &[AccountRecord],
    signers: &BTreeSet<PublicKey>,
) -> Result<(), ValidationError> {
    let (input, output) = single_in_single_out(inputs, outputs)?;
    same_account_details(input, output, signers)?;

    let before = input.meter_readings();
    let after = output.meter_readings();
    require(
        after.len() == before.len() + 1,
        ValidationError::ReadingCountMismatch,
    )?;

    if let (Some(previous), Some(latest)) = (before.last(), after.last()) {
        require(
            latest.timestamp > previous.timestamp,
            ValidationError::ReadingTimeNotIncreasing,
        )?;
        // meter rollover is not modelled, readings only ever increase
        require(
            latest.units > previous.units,
            ValidationError::ReadingValueNotIncreasing,
        )?;
    }
    require(
        &after[..before.len()] == before,
        ValidationError::ReadingHistoryChanged,
    )?;
    require(
        input.billing_entries() == output.billing_entries(),
        ValidationError::BillingHistoryChanged,
    )
}

fn verify_billing_entry(
    inputs: &[AccountRecord],
    outputs: &[AccountRecord],
    signers: &BTreeSet<PublicKey>,
) -> Result<(), ValidationError> {
    let (input, output) = single_in_single_out(inputs, outputs)?;
    same_account_details(input, output, signers)?;

    let before = input.billing_entries();
    let after = output.billing_entries();
    require(
        after.len() == before.len() + 1,
        ValidationError::EntryCountMismatch,
    )?;

    if let (Some(previous), Some(latest)) = (before.last(), after.last()) {
        require(
            latest.timestamp > previous.timestamp,
            ValidationError::EntryTimeNotIncreasing,
        )?;
    }
    require(
        &after[..before.len()] == before,
        ValidationError::BillingHistoryChanged,
    )?;

    let Some(latest) = after.last() else {
        return Err(ValidationError::EntryCountMismatch);
    };
    require(
        latest.supplier.key == output.supplier().key,
        ValidationError::EntryIssuerMismatch,
    )?;
    // a balance that cannot be computed cannot match
    require(
        input
            .balance()
            .checked_add(latest.amount)
            .is_ok_and(|balance| balance == latest.balance),
        ValidationError::RunningBalanceMismatch,
    )?;
    require(
        input.meter_readings() == output.meter_readings(),
        ValidationError::MeterReadingsChanged,
    )
}
