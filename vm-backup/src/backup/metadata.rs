//! Backup metadata records (`<basename>.json`).

use super::{BackupMode, VmBackupContext, VmDescriptor, METADATA_VERSION, XVA_EXTENSION};
use crate::image::IMAGE_EXTENSION;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub job_id: String,
    pub mode: BackupMode,
    pub schedule_id: String,
    pub timestamp: i64,
    pub version: String,
    pub vm: VmDescriptor,
    pub vm_snapshot: Value,

    /// Full backups: `./<basename>.xva`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xva: Option<String>,

    /// Delta backups: `./<basename>.bdi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,

    /// Delta backups: image this one applies on top of, absent for a base
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    pub size: u64,
}

impl BackupMetadata {
    fn common(context: &VmBackupContext, mode: BackupMode, timestamp: i64, size: u64) -> Self {
        Self {
            job_id: context.job.id.clone(),
            mode,
            schedule_id: context.schedule_id.clone(),
            timestamp,
            version: METADATA_VERSION.to_string(),
            vm: context.vm.clone(),
            vm_snapshot: context.exported_vm.clone(),
            xva: None,
            image: None,
            image_uuid: None,
            parent: None,
            size,
        }
    }

    pub fn full(context: &VmBackupContext, timestamp: i64, basename: &str, size: u64) -> Self {
        Self {
            xva: Some(relative(basename, XVA_EXTENSION)),
            ..Self::common(context, BackupMode::Full, timestamp, size)
        }
    }

    pub fn delta(
        context: &VmBackupContext,
        timestamp: i64,
        basename: &str,
        size: u64,
        image_uuid: Uuid,
        parent: Option<String>,
    ) -> Self {
        Self {
            image: Some(relative(basename, IMAGE_EXTENSION)),
            image_uuid: Some(image_uuid),
            parent,
            ..Self::common(context, BackupMode::Delta, timestamp, size)
        }
    }

    /// Relative reference to the data file of this backup
    pub fn data_file(&self) -> Option<&str> {
        match self.mode {
            BackupMode::Full => self.xva.as_deref(),
            BackupMode::Delta => self.image.as_deref(),
        }
    }

    /// Parse and sanity check a metadata file
    pub fn parse(content: &[u8]) -> Result<Self> {
        let metadata: Self = serde_json::from_slice(content)?;
        if !metadata.version.starts_with("2.") {
            return Err(BackupError::Metadata(format!(
                "unsupported metadata version {}",
                metadata.version
            )));
        }
        let data_file = metadata
            .data_file()
            .ok_or_else(|| BackupError::Metadata(format!("{} backup without data file", metadata.mode)))?;
        file_in_dir(data_file)?;
        if let Some(parent) = &metadata.parent {
            file_in_dir(parent)?;
        }
        Ok(metadata)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// `./<basename>.<ext>`
pub fn relative(basename: &str, extension: &str) -> String {
    format!("./{}.{}", basename, extension)
}

/// File name of a relative reference, which must point inside the backup directory
pub fn file_in_dir(reference: &str) -> Result<&str> {
    let name = reference.strip_prefix("./").unwrap_or(reference);
    if name.is_empty() || name.contains('/') || name == ".." {
        return Err(BackupError::Metadata(format!("invalid file reference '{}'", reference)));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupJob;
    use crate::config::JobSettings;
    use serde_json::json;

    fn context() -> VmBackupContext {
        VmBackupContext {
            job: BackupJob {
                id: "job-1".into(),
                mode: BackupMode::Full,
                settings: JobSettings::default(),
            },
            schedule_id: "sched-1".into(),
            vm: VmDescriptor::new("vm-1").with_name("web"),
            exported_vm: json!({ "uuid": "snap-1", "is_a_snapshot": true }),
        }
    }

    #[test]
    fn test_full_metadata_layout() {
        let metadata = BackupMetadata::full(&context(), 1_710_468_000, "20240315T020000Z", 1024);
        let value: Value = serde_json::from_slice(&metadata.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "jobId": "job-1",
                "mode": "full",
                "scheduleId": "sched-1",
                "timestamp": 1_710_468_000,
                "version": "2.0.0",
                "vm": { "uuid": "vm-1", "name_label": "web" },
                "vmSnapshot": { "uuid": "snap-1", "is_a_snapshot": true },
                "xva": "./20240315T020000Z.xva",
                "size": 1024
            })
        );
    }

    #[test]
    fn test_delta_metadata_round_trip() {
        let image_uuid = Uuid::new_v4();
        let metadata = BackupMetadata::delta(
            &context(),
            10,
            "19700101T000010Z",
            512,
            image_uuid,
            Some("./19700101T000005Z.bdi".into()),
        );
        let parsed = BackupMetadata::parse(&metadata.to_json().unwrap()).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.data_file(), Some("./19700101T000010Z.bdi"));
        assert_eq!(parsed.xva, None);

        let value: Value = serde_json::to_value(&parsed).unwrap();
        assert_eq!(value["imageUuid"], image_uuid.to_string());
        assert_eq!(value["mode"], "delta");
    }

    #[test]
    fn test_parse_rejects_bad_records() {
        assert!(BackupMetadata::parse(b"{ not json").is_err());

        let mut metadata = BackupMetadata::full(&context(), 0, "19700101T000000Z", 1);
        metadata.version = "1.0.0".into();
        assert!(BackupMetadata::parse(&metadata.to_json().unwrap()).is_err());

        metadata.version = METADATA_VERSION.into();
        metadata.xva = Some("../other/a.xva".into());
        assert!(BackupMetadata::parse(&metadata.to_json().unwrap()).is_err());

        metadata.xva = None;
        assert!(matches!(
            BackupMetadata::parse(&metadata.to_json().unwrap()),
            Err(BackupError::Metadata(_))
        ));
    }
}
