#[cfg(test)]
mod error_tests {
    use crate::*;

    #[test]
    fn test_batch_error_display() {
        let err = BatchError::device_unavailable(&["3"], &["0", "1"]);
        assert_eq!(
            err.to_string(),
            "设备不可用: [\"3\"]，可用设备: [\"0\", \"1\"]"
        );

        let err = BatchError::no_files_found("/data/in", "*.wav");
        assert_eq!(err.to_string(), "未找到匹配文件: /data/in (*.wav)");

        let err = BatchError::transient("disk busy");
        assert_eq!(err.to_string(), "临时错误: disk busy");

        let err = BatchError::WorkerCrash {
            device: "1".to_string(),
            exit_code: Some(139),
        };
        assert_eq!(err.to_string(), "Worker进程异常退出: 设备 1, 退出码 Some(139)");
    }

    #[test]
    fn test_setup_error_classification() {
        assert!(BatchError::NoDevicesDetected.is_setup_error());
        assert!(BatchError::invalid_device_spec("0,x").is_setup_error());
        assert!(BatchError::no_files_found("/tmp", "*.wav").is_setup_error());
        assert!(BatchError::InputNotFound("/missing".into()).is_setup_error());

        assert!(!BatchError::transient("flaky").is_setup_error());
        assert!(!BatchError::task_execution("bad file").is_setup_error());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BatchError::transient("flaky").is_retryable());
        assert!(BatchError::Timeout("30s".to_string()).is_retryable());

        assert!(!BatchError::task_execution("decode failed").is_retryable());
        assert!(!BatchError::cancelled("shutdown").is_retryable());
        assert!(!BatchError::Internal("oops".to_string()).is_retryable());
    }

    #[test]
    fn test_error_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BatchError = io_err.into();
        assert!(matches!(err, BatchError::Io(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: BatchError = json_err.into();
        assert!(matches!(err, BatchError::Serialization(_)));

        let err: BatchError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "内部错误: boom");
    }

    #[test]
    fn test_cancellation_flag() {
        assert!(BatchError::cancelled("timeout").is_cancellation());
        assert!(!BatchError::transient("x").is_cancellation());
    }
}
