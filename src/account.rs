//! Account record model: one immutable version of a customer's supply account
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::cmp::Ordering;
use std::fmt;

use crate::error::AmountOverflow;
use crate::party::Party;
use crate::utils;

/// Human readable prefix of every account id.
pub const ACCOUNT_HRP: &str = "acct";

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// ordered by instant; `Utc` itself has no ordering to derive from
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn date(&self) -> NaiveDate {
        self.0.date_naive()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

/// Calendar date of birth, no time component.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct BirthDate(NaiveDate);

impl BirthDate {
    pub fn new(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(BirthDate)
    }
    pub fn to_naive_date(&self) -> NaiveDate {
        self.0
    }
}

impl From<NaiveDate> for BirthDate {
    fn from(value: NaiveDate) -> Self {
        BirthDate(value)
    }
}

/// Signed currency amount. Positive is a charge, negative a credit or payment.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Default)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }
    /// Amount in minor units, e.g. `from_minor(1050)` is 10.50.
    pub fn from_minor(minor: i64) -> Self {
        Self(Decimal::new(minor, 2))
    }
    pub fn to_decimal(&self) -> Decimal {
        self.0
    }
    /// Rounded to the currency's minor unit, halves away from zero.
    pub fn round_to_minor(&self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
        )
    }
}

impl Amount {
    pub fn checked_add(self, rhs: Amount) -> Result<Amount, AmountOverflow> {
        self.0.checked_add(rhs.0).map(Amount).ok_or(AmountOverflow)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier shared by every version of one account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(String);

impl AccountId {
    /// A fresh bech32 encoded uuid7 id.
    pub fn generate() -> anyhow::Result<Self> {
        Ok(Self(utils::new_uuid_to_bech32(ACCOUNT_HRP)?))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        AccountId(value.to_string())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CustomerDetails {
    #[n(0)]
    pub first_name: String,
    #[n(1)]
    pub last_name: String,
    #[n(2)]
    pub date_of_birth: BirthDate,
    #[n(3)]
    pub address: String,
    #[n(4)]
    pub phone_number: Option<String>,
    #[n(5)]
    pub email: Option<String>,
}

impl CustomerDetails {
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        date_of_birth: BirthDate,
        address: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            date_of_birth,
            address: address.into(),
            phone_number: None,
            email: None,
        }
    }
    pub fn set_phone_number(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }
    pub fn set_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct MeterReading {
    #[n(0)]
    pub timestamp: TimeStamp<Utc>,
    #[n(1)]
    pub units: u64,
}

impl MeterReading {
    pub fn new(timestamp: TimeStamp<Utc>, units: u64) -> Self {
        Self { timestamp, units }
    }
}

/// One ledger line against an account.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BillingEntry {
    #[n(0)]
    pub supplier: Party,
    #[n(1)]
    pub timestamp: TimeStamp<Utc>,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub amount: Amount,
    #[n(4)]
    pub balance: Amount, // running balance including this entry
}

/// A single version of an account. Superseding a version always produces a
/// new value; nothing here mutates in place.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    #[n(0)]
    id: AccountId,
    #[n(1)]
    regulator: Party,
    #[n(2)]
    supplier: Party,
    #[n(3)]
    customer: CustomerDetails,
    #[n(4)]
    meter_readings: Vec<MeterReading>,
    #[n(5)]
    billing_entries: Vec<BillingEntry>,
}

impl AccountRecord {
    /// A brand new account with empty histories.
    pub fn new(id: AccountId, regulator: Party, supplier: Party, customer: CustomerDetails) -> Self {
        Self {
            id,
            regulator,
            supplier,
            customer,
            meter_readings: vec![],
            billing_entries: vec![],
        }
    }
    /// Like [`AccountRecord::new`] with a freshly generated id.
    pub fn open(regulator: Party, supplier: Party, customer: CustomerDetails) -> anyhow::Result<Self> {
        Ok(Self::new(AccountId::generate()?, regulator, supplier, customer))
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }
    pub fn regulator(&self) -> &Party {
        &self.regulator
    }
    pub fn supplier(&self) -> &Party {
        &self.supplier
    }
    pub fn customer(&self) -> &CustomerDetails {
        &self.customer
    }
    pub fn meter_readings(&self) -> &[MeterReading] {
        &self.meter_readings
    }
    pub fn billing_entries(&self) -> &[BillingEntry] {
        &self.billing_entries
    }
    /// Parties entitled to hold this version. The regulator observes every
    /// version for audit but is not a participant.
    pub fn participants(&self) -> Vec<&Party> {
        vec![&self.supplier]
    }
    pub fn balance(&self) -> Amount {
        self.billing_entries
            .last()
            .map(|entry| entry.balance)
            .unwrap_or(Amount::ZERO)
    }

    pub fn with_id(&self, id: AccountId) -> Self {
        Self { id, ..self.clone() }
    }
    pub fn with_regulator(&self, regulator: Party) -> Self {
        Self {
            regulator,
            ..self.clone()
        }
    }
    pub fn with_supplier(&self, supplier: Party) -> Self {
        Self {
            supplier,
            ..self.clone()
        }
    }
    pub fn with_customer(&self, customer: CustomerDetails) -> Self {
        Self {
            customer,
            ..self.clone()
        }
    }
    pub fn with_meter_readings(&self, meter_readings: Vec<MeterReading>) -> Self {
        Self {
            meter_readings,
            ..self.clone()
        }
    }
    pub fn with_billing_entries(&self, billing_entries: Vec<BillingEntry>) -> Self {
        Self {
            billing_entries,
            ..self.clone()
        }
    }
    /// Appends a reading taken at `timestamp`, or now if absent.
    pub fn with_new_reading(&self, units: u64, timestamp: Option<TimeStamp<Utc>>) -> Self {
        let mut meter_readings = self.meter_readings.clone();
        meter_readings.push(MeterReading::new(timestamp.unwrap_or_default(), units));
        self.with_meter_readings(meter_readings)
    }
    /// Appends an entry issued by the current supplier, carrying the running balance forward.
    pub fn with_new_billing_entry(
        &self,
        description: impl Into<String>,
        amount: Amount,
        timestamp: Option<TimeStamp<Utc>>,
    ) -> Result<Self, AmountOverflow> {
        let entry = BillingEntry {
            supplier: self.supplier.clone(),
            timestamp: timestamp.unwrap_or_default(),
            description: description.into(),
            amount,
            balance: self.balance().checked_add(amount)?,
        };
        let mut billing_entries = self.billing_entries.clone();
        billing_entries.push(entry);
        Ok(self.with_billing_entries(billing_entries))
    }

    /// Returns the sha256 of this version encoded as cbor, and the encoding.
    pub fn build(&self) -> anyhow::Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}
impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl<C> minicbor::Encode<C> for BirthDate {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        use chrono::Datelike;
        e.i32(self.0.num_days_from_ce())?.ok()
    }
}
impl<'b, C> minicbor::Decode<'b, C> for BirthDate {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let days = d.i32()?;

        NaiveDate::from_num_days_from_ce_opt(days)
            .map(BirthDate)
            .ok_or(minicbor::decode::Error::message(
                "failed to convert day count to a date",
            ))
    }
}

impl<C> minicbor::Encode<C> for Amount {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0.serialize())?.ok()
    }
}
impl<'b, C> minicbor::Decode<'b, C> for Amount {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let bytes: [u8; 16] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("decimal must be 16 bytes"))?;

        Ok(Amount(Decimal::deserialize(bytes)))
    }
}

impl<C> minicbor::Encode<C> for AccountId {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}
impl<'b, C> minicbor::Decode<'b, C> for AccountId {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(AccountId(d.str()?.to_string()))
    }
}
