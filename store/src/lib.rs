pub mod db;
pub mod model;
pub mod queries;
pub mod repository;
pub mod rfc3339;
pub mod schema;

pub use db::Db;
pub use model::{Allocation, Reservation, ReservationStatus, ReservedSlot, TargetType};
