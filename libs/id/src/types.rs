//! Typed id definitions for drender resources.

use crate::{define_id, define_string_id};

// Jobs are minted by the driver, one fresh id per partition chunk.
define_id!(JobId, "job");

// Project ids are chosen by the submitting user; instance ids are assigned by
// the cloud provider. Both are opaque to the driver.
define_string_id!(ProjectId);
define_string_id!(InstanceId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new();
        let s = id.to_string();
        let parsed: JobId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_job_id_prefix() {
        let id = JobId::new();
        assert!(id.to_string().starts_with("job_"));
    }

    #[test]
    fn test_job_id_invalid_prefix() {
        let result: Result<JobId, _> = "inst_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        match result.unwrap_err() {
            crate::IdError::InvalidPrefix { expected, actual } => {
                assert_eq!(expected, "job");
                assert_eq!(actual, "inst");
            }
            other => panic!("expected InvalidPrefix, got {other:?}"),
        }
    }

    #[test]
    fn test_job_id_missing_separator() {
        let result: Result<JobId, _> = "job01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::MissingSeparator));
    }

    #[test]
    fn test_job_id_invalid_ulid() {
        let result: Result<JobId, _> = "job_notaulid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_job_id_sortable() {
        let id1 = JobId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_job_id_json_roundtrip() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_project_id_accepts_user_names() {
        let id = ProjectId::parse("short-film-042").unwrap();
        assert_eq!(id.as_str(), "short-film-042");
    }

    #[test]
    fn test_project_id_rejects_empty() {
        assert!(matches!(
            ProjectId::parse("").unwrap_err(),
            crate::IdError::Empty
        ));
    }

    #[test]
    fn test_project_id_rejects_whitespace() {
        assert!(matches!(
            ProjectId::parse("my project").unwrap_err(),
            crate::IdError::IllegalCharacters(_)
        ));
    }

    #[test]
    fn test_instance_id_json_is_plain_string() {
        let id = InstanceId::parse("i-0abc123def").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"i-0abc123def\"");
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
