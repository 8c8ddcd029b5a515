//! Vendor schedule store: per-vendor aggregates with copy-on-write atomic
//! replacement, plus JSON snapshot persistence.
//!
//! Every mutation builds a fresh aggregate and swaps the `Arc`, so a reader
//! holding a schedule never observes a partially-replaced week.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use chrono::NaiveDate;
use chrono_tz::Tz;
use sporkd_core::{validate_weekly, ExceptionDate, ScheduleError, VendorSchedule, WeeklyRule};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sporkd-storage";

#[derive(Debug, Default)]
pub struct ScheduleStore {
    vendors: RwLock<HashMap<Uuid, Arc<VendorSchedule>>>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty schedule for a vendor. A vendor already registered
    /// keeps its existing schedule and zone.
    pub fn register(&self, vendor_id: Uuid, timezone: &str) -> Result<(), ScheduleError> {
        let tz = Tz::from_str(timezone)
            .map_err(|_| ScheduleError::UnknownTimeZone(timezone.to_string()))?;
        let mut vendors = self.vendors.write().expect("schedule store lock poisoned");
        vendors
            .entry(vendor_id)
            .or_insert_with(|| Arc::new(VendorSchedule::new(tz)));
        Ok(())
    }

    pub fn get(&self, vendor_id: Uuid) -> Result<Arc<VendorSchedule>, ScheduleError> {
        let vendors = self.vendors.read().expect("schedule store lock poisoned");
        vendors
            .get(&vendor_id)
            .cloned()
            .ok_or(ScheduleError::VendorNotFound(vendor_id))
    }

    /// Full replacement of the recurring week, the only weekly mutation
    /// contract. Rules are validated and stored sorted by
    /// `(day_of_week, interval_index)`.
    pub fn replace_weekly(
        &self,
        vendor_id: Uuid,
        mut rules: Vec<WeeklyRule>,
    ) -> Result<(), ScheduleError> {
        validate_weekly(&rules)?;
        rules.sort_by_key(|r| (r.day_of_week, r.interval_index));

        let mut vendors = self.vendors.write().expect("schedule store lock poisoned");
        let current = vendors
            .get(&vendor_id)
            .ok_or(ScheduleError::VendorNotFound(vendor_id))?;
        let mut next = VendorSchedule::clone(current);
        next.weekly = rules;
        vendors.insert(vendor_id, Arc::new(next));
        Ok(())
    }

    /// Add a dated override. One exception per date; replacing means
    /// delete-then-add.
    pub fn add_exception(
        &self,
        vendor_id: Uuid,
        exception: ExceptionDate,
    ) -> Result<(), ScheduleError> {
        if !exception.is_closed {
            match (exception.start_local, exception.end_local) {
                (Some(start), Some(end)) if start != end => {}
                _ => {
                    return Err(ScheduleError::Validation(format!(
                        "exception {} needs distinct start and end unless closed",
                        exception.date
                    )))
                }
            }
        }

        let mut vendors = self.vendors.write().expect("schedule store lock poisoned");
        let current = vendors
            .get(&vendor_id)
            .ok_or(ScheduleError::VendorNotFound(vendor_id))?;
        if current.exceptions.contains_key(&exception.date) {
            return Err(ScheduleError::Conflict(exception.date));
        }
        let mut next = VendorSchedule::clone(current);
        next.exceptions.insert(exception.date, exception);
        vendors.insert(vendor_id, Arc::new(next));
        Ok(())
    }

    /// Strict delete policy: removing an exception that does not exist is an
    /// error, matching the owner-editing surface's 404 behavior.
    pub fn delete_exception(&self, vendor_id: Uuid, date: NaiveDate) -> Result<(), ScheduleError> {
        let mut vendors = self.vendors.write().expect("schedule store lock poisoned");
        let current = vendors
            .get(&vendor_id)
            .ok_or(ScheduleError::VendorNotFound(vendor_id))?;
        if !current.exceptions.contains_key(&date) {
            return Err(ScheduleError::ExceptionNotFound(date));
        }
        let mut next = VendorSchedule::clone(current);
        next.exceptions.remove(&date);
        vendors.insert(vendor_id, Arc::new(next));
        Ok(())
    }

    /// Dated exception records in calendar order, past dates included.
    pub fn exceptions(&self, vendor_id: Uuid) -> Result<Vec<ExceptionDate>, ScheduleError> {
        let schedule = self.get(vendor_id)?;
        Ok(schedule.exceptions.values().cloned().collect())
    }

    pub fn vendor_ids(&self) -> Vec<Uuid> {
        let vendors = self.vendors.read().expect("schedule store lock poisoned");
        vendors.keys().copied().collect()
    }

    /// Persist all schedules as one JSON document via temp-file write and
    /// atomic rename.
    pub async fn save_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot: BTreeMap<Uuid, VendorSchedule> = {
            let vendors = self.vendors.read().expect("schedule store lock poisoned");
            vendors
                .iter()
                .map(|(id, schedule)| (*id, VendorSchedule::clone(schedule)))
                .collect()
        };
        let bytes =
            serde_json::to_vec_pretty(&snapshot).context("serializing schedule snapshot")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, path).await {
            Ok(()) => {
                info!(path = %path.display(), vendors = snapshot.len(), "schedule snapshot saved");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    pub async fn load_snapshot(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let snapshot: HashMap<Uuid, VendorSchedule> =
            serde_json::from_slice(&bytes).context("parsing schedule snapshot")?;
        info!(path = %path.display(), vendors = snapshot.len(), "schedule snapshot loaded");
        Ok(Self {
            vendors: RwLock::new(
                snapshot
                    .into_iter()
                    .map(|(id, schedule)| (id, Arc::new(schedule)))
                    .collect(),
            ),
        })
    }
}
