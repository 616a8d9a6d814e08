//! The migration call sequence: build the guest reference and settings
//! payload, run the feasibility pre-check, trigger the migration, and poll
//! the returned job to a terminal state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cim::{CimClient, CimInstance, CimInstanceName, CimValue, MethodParam};
use crate::mof::{self, MofValue};
use crate::{MigrateError, Result};

/// Terminal CIM_ConcreteJob.JobState value.
pub const JOBSTATE_COMPLETE: i64 = 7;

/// Status text a successfully completed migration job reports.
pub const STATUS_COMPLETED: &str = "Completed";

/// Fixed interval between job re-fetches.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Virtualization platform the managed host runs. Closed set; the variant
/// only selects the class tags the remote provider registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtType {
    Xen,
    Kvm,
}

impl VirtType {
    /// Accepts `Xen`/`KVM` in any casing. Anything else is an error, never
    /// a default: an unknown tag would only fail later on the remote side
    /// as a nonexistent class.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.eq_ignore_ascii_case("xen") {
            Ok(VirtType::Xen)
        } else if raw.eq_ignore_ascii_case("kvm") {
            Ok(VirtType::Kvm)
        } else {
            Err(MigrateError::UnsupportedVirtType(raw.to_string()))
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            VirtType::Xen => "Xen",
            VirtType::Kvm => "KVM",
        }
    }

    pub fn computer_system_class(&self) -> String {
        format!("{}_ComputerSystem", self.prefix())
    }

    pub fn migration_service_class(&self) -> String {
        format!("{}_VirtualSystemMigrationService", self.prefix())
    }

    pub fn migration_setting_data_class(&self) -> String {
        format!("{}_VirtualSystemMigrationSettingData", self.prefix())
    }
}

/// CIM_VirtualSystemMigrationSettingData.MigrationType codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MigrationType {
    Other = 1,
    Live = 2,
    Resume = 3,
    Restart = 4,
}

impl MigrationType {
    /// Map a requested migration-type string to its code. Unrecognized
    /// strings deliberately degrade to `Other` instead of failing.
    pub fn from_option(raw: &str) -> Self {
        match raw {
            "live" => MigrationType::Live,
            "resume" => MigrationType::Resume,
            "restart" => MigrationType::Restart,
            _ => MigrationType::Other,
        }
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }
}

/// Migration settings payload. One record with a virt-type field replaces
/// the per-platform setting-data subclasses: the variants only ever
/// differed in their class tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
    pub virt: VirtType,
    pub migration_type: MigrationType,
    pub priority: u32,
}

impl MigrationSettings {
    pub const INSTANCE_ID: &'static str = "MigrationSettingData";

    pub fn new(migration_type: &str, virt: VirtType) -> Self {
        Self {
            virt,
            migration_type: MigrationType::from_option(migration_type),
            priority: 0,
        }
    }

    /// Wire form: a MOF instance block over the declared field list.
    pub fn to_mof(&self) -> String {
        let class_name = self.virt.migration_setting_data_class();
        mof::render_instance(
            &class_name,
            &[
                ("InstanceID", MofValue::Str(Self::INSTANCE_ID.to_string())),
                ("CreationClassName", MofValue::Str(class_name.clone())),
                (
                    "MigrationType",
                    MofValue::Int(i64::from(self.migration_type.code())),
                ),
                ("Priority", MofValue::Int(i64::from(self.priority))),
            ],
        )
    }
}

/// Build the keyed reference identifying the guest to migrate.
pub fn guest_ref(guest: &str, virt: VirtType) -> CimInstanceName {
    let class_name = virt.computer_system_class();
    debug!(guest, %class_name, "building guest reference");
    CimInstanceName::new(&class_name)
        .with_key("Name", guest)
        .with_key("CreationClassName", &class_name)
}

fn migration_params(
    guest: &CimInstanceName,
    dest_host: &str,
    settings_mof: Option<&str>,
) -> Vec<MethodParam> {
    let mut params = vec![
        MethodParam::Reference("ComputerSystem", guest.clone()),
        MethodParam::String("DestinationHost", dest_host.to_string()),
    ];
    if let Some(mof_text) = settings_mof {
        params.push(MethodParam::String(
            "MigrationSettingData",
            mof_text.to_string(),
        ));
    }
    params
}

/// Pre-flight feasibility check. Succeeds only when the provider answers
/// with `IsMigratable` set to boolean true; a false, missing, or
/// wrongly-typed answer fails.
pub fn check_migratable(
    client: &impl CimClient,
    guest: &CimInstanceName,
    dest_host: &str,
    settings_mof: Option<&str>,
    virt: VirtType,
) -> Result<()> {
    let response = client.invoke_method(
        "CheckVirtualSystemIsMigratableToHost",
        &virt.migration_service_class(),
        &migration_params(guest, dest_host, settings_mof),
    )?;

    match response.out_param("IsMigratable").and_then(CimValue::as_bool) {
        Some(true) => {
            info!(dest_host, "guest is migratable");
            Ok(())
        }
        _ => Err(MigrateError::NotMigratable),
    }
}

/// Trigger the migration and extract the asynchronous job reference from
/// the response.
pub fn migrate_to_host(
    client: &impl CimClient,
    guest: &CimInstanceName,
    dest_host: &str,
    settings_mof: Option<&str>,
    virt: VirtType,
) -> Result<CimInstanceName> {
    let response = client.invoke_method(
        "MigrateVirtualSystemToHost",
        &virt.migration_service_class(),
        &migration_params(guest, dest_host, settings_mof),
    )?;

    match response.out_param("Job").and_then(CimValue::as_reference) {
        Some(job_ref) => {
            info!(job_class = %job_ref.class_name, "migration job started");
            Ok(job_ref.clone())
        }
        None => Err(MigrateError::NoJobReturned),
    }
}

/// Knobs for the poll loop. The defaults match the historical behavior:
/// a fixed 3 s interval and no wall-clock bound.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Poll the migration job until it reaches the terminal COMPLETE state,
/// then judge its `Status` text. Cancellation (Ctrl-C) and the optional
/// timeout both convert to the graceful "took too long" failure instead of
/// tearing the process down mid-wait.
///
/// Returns the terminal status text (always `"Completed"`) on success.
pub fn poll_job(
    client: &impl CimClient,
    job_ref: &CimInstanceName,
    cancel: &AtomicBool,
    options: PollOptions,
) -> Result<String> {
    let started = Instant::now();
    let mut job = fetch_job(client, job_ref)?;

    while job_state(&job) != Some(JOBSTATE_COMPLETE) {
        if cancel.load(Ordering::SeqCst) {
            return Err(MigrateError::Interrupted);
        }
        if let Some(limit) = options.timeout {
            if started.elapsed() >= limit {
                return Err(MigrateError::Interrupted);
            }
        }
        thread::sleep(options.interval);
        if cancel.load(Ordering::SeqCst) {
            return Err(MigrateError::Interrupted);
        }
        job = fetch_job(client, job_ref)?;
    }

    let status = job
        .property("Status")
        .and_then(CimValue::as_str)
        .unwrap_or_default()
        .to_string();

    if status == STATUS_COMPLETED {
        Ok(status)
    } else {
        Err(MigrateError::JobFailed(status))
    }
}

fn job_state(job: &CimInstance) -> Option<i64> {
    job.property("JobState").and_then(CimValue::as_number)
}

/// Every fetch failure is immediately fatal; the remote error is reported
/// before the failure is folded into the poller's own error.
fn fetch_job(client: &impl CimClient, job_ref: &CimInstanceName) -> Result<CimInstance> {
    client.get_instance(job_ref).map_err(|err| {
        if matches!(err, MigrateError::Cim { .. }) {
            println!("{}", err);
        }
        MigrateError::JobFetchFailed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_type_mapping_is_total() {
        assert_eq!(MigrationType::from_option("live"), MigrationType::Live);
        assert_eq!(MigrationType::from_option("resume"), MigrationType::Resume);
        assert_eq!(
            MigrationType::from_option("restart"),
            MigrationType::Restart
        );
        assert_eq!(
            MigrationType::from_option("warp-speed"),
            MigrationType::Other
        );
        assert_eq!(MigrationType::from_option(""), MigrationType::Other);
    }

    #[test]
    fn migration_type_codes_match_the_cim_schema() {
        assert_eq!(MigrationType::Other.code(), 1);
        assert_eq!(MigrationType::Live.code(), 2);
        assert_eq!(MigrationType::Resume.code(), 3);
        assert_eq!(MigrationType::Restart.code(), 4);
    }

    #[test]
    fn virt_type_accepts_only_xen_and_kvm() {
        assert_eq!(VirtType::parse("Xen").unwrap(), VirtType::Xen);
        assert_eq!(VirtType::parse("KVM").unwrap(), VirtType::Kvm);
        assert_eq!(VirtType::parse("xen").unwrap(), VirtType::Xen);
        assert_eq!(VirtType::parse("kvm").unwrap(), VirtType::Kvm);

        assert!(matches!(
            VirtType::parse("LXC"),
            Err(MigrateError::UnsupportedVirtType(_))
        ));
        assert!(matches!(
            VirtType::parse(""),
            Err(MigrateError::UnsupportedVirtType(_))
        ));
    }

    #[test]
    fn settings_select_the_platform_class_tag() {
        let xen = MigrationSettings::new("live", VirtType::Xen);
        let kvm = MigrationSettings::new("live", VirtType::Kvm);

        assert!(xen.to_mof().contains("Xen_VirtualSystemMigrationSettingData"));
        assert!(kvm.to_mof().contains("KVM_VirtualSystemMigrationSettingData"));
    }

    #[test]
    fn settings_mof_carries_the_declared_fields() {
        let settings = MigrationSettings::new("restart", VirtType::Kvm);
        let mof = settings.to_mof();

        assert!(mof.starts_with("instance of KVM_VirtualSystemMigrationSettingData {"));
        assert!(mof.contains("InstanceID = \"MigrationSettingData\";"));
        assert!(mof.contains("CreationClassName = \"KVM_VirtualSystemMigrationSettingData\";"));
        assert!(mof.contains("MigrationType = 4;"));
        assert!(mof.contains("Priority = 0;"));
        assert!(mof.ends_with("};"));
    }

    #[test]
    fn guest_ref_is_name_plus_class_tag() {
        let path = guest_ref("myvm1", VirtType::Xen);
        assert_eq!(path.class_name, "Xen_ComputerSystem");
        assert_eq!(path.key("Name"), Some("myvm1"));
        assert_eq!(path.key("CreationClassName"), Some("Xen_ComputerSystem"));
    }

    #[test]
    fn settings_payload_is_only_sent_when_present() {
        let guest = guest_ref("myvm1", VirtType::Kvm);

        let without = migration_params(&guest, "target", None);
        assert_eq!(without.len(), 2);

        let mof = MigrationSettings::new("live", VirtType::Kvm).to_mof();
        let with = migration_params(&guest, "target", Some(&mof));
        assert_eq!(with.len(), 3);
        assert_eq!(with[2].name(), "MigrationSettingData");
    }
}
