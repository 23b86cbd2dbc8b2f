use corewarden_core::ProcessManagerFactory;
use std::sync::Arc;
use tracing::info;

/// Process manager for the platform this crate was compiled for
#[cfg(unix)]
pub type PlatformProcessManager = corewarden_unix::UnixProcessManager;

#[cfg(windows)]
pub type PlatformProcessManager = corewarden_windows::WindowsProcessManager;

#[cfg(not(any(unix, windows)))]
compile_error!("Unsupported platform: only Unix and Windows are currently supported");

/// Platform-agnostic factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    type Manager = PlatformProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return corewarden_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return corewarden_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return corewarden_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return corewarden_windows::WindowsProcessManagerFactory::platform_name();
    }
}

/// Shared platform process manager
pub fn create_process_manager() -> Arc<PlatformProcessManager> {
    info!(
        platform = PlatformProcessManagerFactory::platform_name(),
        "Creating process manager"
    );
    Arc::new(PlatformProcessManagerFactory::create_process_manager())
}
