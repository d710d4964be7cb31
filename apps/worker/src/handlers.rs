pub mod build_jobs;
pub mod health;
