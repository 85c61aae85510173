pub mod error;
pub mod ids;
pub mod logger;
pub mod reservation_info;
pub mod time;

pub use error::SchedulerError;
pub use reservation_info::ReservationInfo;
