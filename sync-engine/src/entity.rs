use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const TEMP_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Tractor,
    Prediction,
    Booking,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Tractor, EntityType::Prediction, EntityType::Booking];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Tractor => "tractor",
            EntityType::Prediction => "prediction",
            EntityType::Booking => "booking",
        }
    }

    /// Payload field holding the owning record's id.
    pub fn owner_field(&self) -> &'static str {
        match self {
            EntityType::Tractor => "coop_id",
            EntityType::Prediction => "tractor_id",
            EntityType::Booking => "member_id",
        }
    }

    /// Payload fields that hold the id of another entity, with that entity's
    /// type. Rewritten when the referenced entity's temporary id is remapped.
    pub fn reference_fields(&self) -> &'static [(&'static str, EntityType)] {
        match self {
            EntityType::Tractor => &[],
            EntityType::Prediction => &[("tractor_id", EntityType::Tractor)],
            EntityType::Booking => &[("tractor_id", EntityType::Tractor)],
        }
    }

    /// Collection segment used in `/entities/{type}` URLs.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Tractor => "tractors",
            EntityType::Prediction => "predictions",
            EntityType::Booking => "bookings",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tractor" | "tractors" => Ok(EntityType::Tractor),
            "prediction" | "predictions" => Ok(EntityType::Prediction),
            "booking" | "bookings" => Ok(EntityType::Booking),
            other => Err(Error::LocalStorage(format!("unknown entity type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            "delete" => Ok(MutationAction::Delete),
            other => Err(Error::LocalStorage(format!("unknown mutation action '{}'", other))),
        }
    }
}

pub fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Ids minted on the device before the server has assigned one.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// A domain payload the repositories know how to persist and queue.
pub trait DomainEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    fn owner_id(&self) -> &str;

    fn validate(&self) -> Result<()>;
}

/// A domain payload as read back from the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity<T> {
    pub id: String,
    pub synced: bool,
    pub local_revision: u64,
    pub data: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TractorModel {
    #[serde(rename = "MF_240")]
    Mf240,
    #[serde(rename = "MF_375")]
    Mf375,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageIntensity {
    Light,
    #[default]
    Moderate,
    Heavy,
    Extreme,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tractor {
    pub coop_id: String,
    pub model: TractorModel,
    pub serial_number: String,
    pub engine_hours: f64,
    #[serde(default)]
    pub usage_intensity: UsageIntensity,
    #[serde(default = "default_tractor_status")]
    pub current_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_date: Option<String>,
}

fn default_tractor_status() -> String {
    "available".to_string()
}

impl Tractor {
    pub fn new(coop_id: &str, model: TractorModel, serial_number: &str, engine_hours: f64) -> Self {
        Self {
            coop_id: coop_id.to_string(),
            model,
            serial_number: serial_number.to_string(),
            engine_hours,
            usage_intensity: UsageIntensity::default(),
            current_status: default_tractor_status(),
            purchase_date: None,
        }
    }
}

impl DomainEntity for Tractor {
    const ENTITY_TYPE: EntityType = EntityType::Tractor;

    fn owner_id(&self) -> &str {
        &self.coop_id
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("coop_id", &self.coop_id)?;
        require_non_empty("serial_number", &self.serial_number)?;
        if !self.engine_hours.is_finite() || self.engine_hours < 0.0 {
            return Err(Error::Validation(format!(
                "engine_hours must be a non-negative number, got {}",
                self.engine_hours
            )));
        }
        if let Some(date) = &self.purchase_date {
            parse_date("purchase_date", date)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Overdue,
    Urgent,
    DueSoon,
    Upcoming,
}

/// Maintenance prediction for a single tractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub tractor_id: String,
    pub task_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: PredictionStatus,
    pub urgency_level: u8,
    pub hours_remaining: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl DomainEntity for Prediction {
    const ENTITY_TYPE: EntityType = EntityType::Prediction;

    fn owner_id(&self) -> &str {
        &self.tractor_id
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("tractor_id", &self.tractor_id)?;
        require_non_empty("task_name", &self.task_name)?;
        if !self.hours_remaining.is_finite() {
            return Err(Error::Validation("hours_remaining must be finite".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub tractor_id: String,
    pub member_id: String,
    pub coop_id: String,
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_booking_status")]
    pub booking_status: String,
    #[serde(default = "default_payment_status")]
    pub payment_status: String,
    pub payment_amount_rwf: i64,
}

fn default_booking_status() -> String {
    "pending".to_string()
}

fn default_payment_status() -> String {
    "unpaid".to_string()
}

impl DomainEntity for Booking {
    const ENTITY_TYPE: EntityType = EntityType::Booking;

    fn owner_id(&self) -> &str {
        &self.member_id
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("tractor_id", &self.tractor_id)?;
        require_non_empty("member_id", &self.member_id)?;
        require_non_empty("coop_id", &self.coop_id)?;
        let start = parse_date("start_date", &self.start_date)?;
        let end = parse_date("end_date", &self.end_date)?;
        if end < start {
            return Err(Error::Validation(format!(
                "end_date {} precedes start_date {}",
                self.end_date, self.start_date
            )));
        }
        if self.payment_amount_rwf < 0 {
            return Err(Error::Validation("payment_amount_rwf must not be negative".to_string()));
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| Error::Validation(format!("{} must be YYYY-MM-DD, got '{}'", field, value)))
}
