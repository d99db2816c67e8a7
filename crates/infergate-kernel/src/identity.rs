//! Identity types for work units and external jobs.

/// Unique identifier of a work-unit record (registry primary key).
pub type UnitId = String;

/// Identifier assigned by the external service when a batch job is accepted
/// (registry secondary key once assigned).
pub type JobHandle = String;

/// Returns the job id embedded in a handle: the segment after the last `/`.
///
/// Handles of managed batch jobs are resource names such as
/// `arn:aws:bedrock:us-east-1:123456789012:model-invocation-job/abc123`; the
/// service writes each job's artifacts under that trailing id.
pub fn job_id_from_handle(handle: &str) -> &str {
    handle.rsplit('/').next().unwrap_or(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_last_path_segment() {
        assert_eq!(
            job_id_from_handle("arn:aws:bedrock:us-east-1:1:model-invocation-job/j-42"),
            "j-42"
        );
    }

    #[test]
    fn job_id_of_plain_handle_is_the_handle() {
        assert_eq!(job_id_from_handle("job-7"), "job-7");
    }
}
