//! Remote collaborators: the config-service client and emergency backups.

pub mod backup;
pub mod dashboard;

pub use backup::{load_backup, save_backup};
pub use dashboard::DashboardClient;
