pub mod host_jobs;
