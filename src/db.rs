pub mod models;
pub mod queries;

pub use queries::{
    create_pool, delete_job, get_job, latest_scheduled_job, list_jobs, run_migrations, save_job,
};
