/*!
 * Sandbox Limits and Constants
 *
 * Centralized location for defaults, fixed mount points and timeouts.
 * Organized by domain for discoverability.
 */

use std::time::Duration;

// =============================================================================
// SOURCE STAGING
// =============================================================================

/// Mount point of the staged source directory inside mount-capable sandboxes
pub const SOURCE_MOUNT_POINT: &str = "/src";

/// File name of the staged script inside the staging directory
pub const SCRIPT_FILE_NAME: &str = "script.sh";

/// Prefix of per-call staging directories
pub const STAGING_DIR_PREFIX: &str = "source_";

/// Prefix of per-instance private temp directories
pub const INSTANCE_DIR_PREFIX: &str = "sandboxer-";

/// Interpreter used for staged sources on host-tool backends
pub const DEFAULT_SCRIPT_INTERPRETER: &str = "bash";

/// Interpreter used for staged sources inside containers (alpine has no bash)
pub const CONTAINER_SCRIPT_INTERPRETER: &str = "/bin/sh";

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Deadline for capability probe subprocesses (5s)
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for enabling or disabling an optional OS feature (5min)
pub const FEATURE_TOGGLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default whole-sequence deadline for a container run (30s)
pub const DEFAULT_CONTAINER_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// BACKEND FIXTURES
// =============================================================================

/// Host directories exposed read-only when bubblewrap host passthrough is on
pub const BWRAP_HOST_SYSTEM_DIRS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin"];

/// Fixed systemd-run prologue
pub const SYSTEMD_RUN_PROLOGUE: &[&str] = &["--pipe", "--pty", "--user"];

/// Desktop of the Windows Sandbox guest account; mapped folders land here by default
pub const WINDOWS_DEFAULT_MOUNT_POINT: &str = r"C:\Users\WDAGUtilityAccount\Desktop";

/// Logon command appended when the guest firewall should be disabled
pub const WINDOWS_DISABLE_FIREWALL_COMMAND: &str = "netsh advfirewall set allprofiles state off";

/// Optional feature name of Windows Sandbox
pub const WINDOWS_SANDBOX_FEATURE: &str = "Containers-DisposableClientVM";
