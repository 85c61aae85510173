use chrono::NaiveDate;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::calendar::LocalTime;

#[derive(Clone, Debug)]
pub enum AllocateDates {
    Ranges(Vec<(LocalTime, LocalTime)>),
    /// Expands to one `[00:00, 24:00)` local pair per day in range.
    WholeDays { start_date: NaiveDate, end_date: NaiveDate },
}

#[derive(Clone, Debug)]
pub struct AllocateOptions {
    pub quota: i32,
    pub quota_limit: i32,
    pub partly_available: bool,
    pub approve_manually: bool,
    pub grouped: bool,
    pub raster: i32,
    pub waitinglist_spots: Option<i32>,
    pub data: Option<Json>,
}

impl Default for AllocateOptions {
    fn default() -> Self {
        Self {
            quota: 1,
            quota_limit: 0,
            partly_available: false,
            approve_manually: true,
            grouped: false,
            raster: 5,
            waitinglist_spots: None,
            data: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChangeAllocationAttrs {
    pub quota: Option<i32>,
    pub quota_limit: Option<i32>,
    pub partly_available: Option<bool>,
    pub approve_manually: Option<bool>,
    pub waitinglist_spots: Option<Option<i32>>,
    pub raster: Option<i32>,
    pub data: Option<Option<Json>>,
}

#[derive(Clone, Debug)]
pub enum RemoveAllocationTarget {
    Id(Uuid),
    Group(Uuid),
}

#[derive(Clone, Debug)]
pub enum ReserveTarget {
    Dates(Vec<(LocalTime, LocalTime)>),
    Group(Uuid),
}

#[derive(Clone, Debug)]
pub struct ReserveInput {
    pub email: String,
    pub target: ReserveTarget,
    pub data: Option<Json>,
    pub session_id: Option<Uuid>,
    pub quota: i32,
    pub single_token_per_session: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RemoveUnusedFilter {
    pub group: Option<Uuid>,
    pub weekdays: Option<Vec<chrono::Weekday>>,
    pub exclude_groups: bool,
}
