use crate::config::VmConfig;
use crate::error::Result;
use crate::files::{FileEngine, SharedFiles};
use crate::types::{GuestExit, RunResult};
use crate::vmm::devices::Console;
use crate::vmm::run::run_vm;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;


/// Launches every configured guest on its own thread and waits for all of them.
pub struct VMRunner {
    config: VmConfig,
    shared: Arc<SharedFiles>,
}


impl VMRunner {
    pub fn new(config: VmConfig) -> Result<Self> {
        config.validate()?;
        // Shared names are host paths relative to the working directory.
        let shared = Arc::new(SharedFiles::new(PathBuf::new(), config.shared_files.iter().cloned()));
        Ok(Self { config, shared })
    }

    pub fn shared_files(&self) -> &SharedFiles {
        &self.shared
    }

    /// Run all guests to completion. A guest that fails to start or whose
    /// loop aborts is reported in its result; the others keep running.
    pub fn run(&self) -> Vec<RunResult> {
        info!(
            "starting {} guest(s), {} shared file(s)",
            self.config.guests.len(),
            self.shared.len()
        );

        let workers: Vec<_> = self
            .config
            .guests
            .iter()
            .cloned()
            .map(|guest| {
                let machine = self.config.machine.clone();
                let engine = FileEngine::new(Arc::clone(&self.shared), self.config.private_dir.clone());
                let name = guest.display().to_string();
                let handle = thread::Builder::new()
                    .name(thread_name(&guest))
                    .spawn(move || match run_vm(&machine, &guest, engine, Console::stdio()) {
                        Ok(res) => res,
                        Err(e) => {
                            error!("{}: {}", guest.display(), e);
                            failed(&guest, e.to_string())
                        }
                    });
                (name, handle)
            })
            .collect();

        workers
            .into_iter()
            .map(|(name, handle)| {
                let joined = match handle {
                    Ok(h) => h.join().map_err(|_| "guest thread panicked".to_string()),
                    Err(e) => Err(format!("cannot spawn guest thread: {}", e)),
                };
                let res = joined.unwrap_or_else(|msg| {
                    error!("{}: {}", name, msg);
                    failed(&PathBuf::from(&name), msg)
                });
                info!("{}: {}", res.guest, res.exit);
                res
            })
            .collect()
    }
}


fn failed(guest: &std::path::Path, error: String) -> RunResult {
    RunResult {
        guest: guest.display().to_string(),
        exit: GuestExit::Failed { error },
        exits_handled: 0,
        file_ops: 0,
    }
}


fn thread_name(guest: &std::path::Path) -> String {
    let stem = guest.file_stem().map(|s| s.to_string_lossy().into_owned());
    format!("vcpu-{}", stem.unwrap_or_else(|| "guest".into()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemorySize, PageSize};

    #[test]
    fn runner_rejects_duplicate_guests() {
        let mut cfg = VmConfig::new(MemorySize::Mib2, PageSize::Large2M);
        cfg.guests = vec!["g1.img".into(), "g1.img".into()];
        assert!(VMRunner::new(cfg).is_err());
    }

    #[test]
    fn runner_builds_allowlist() {
        let mut cfg = VmConfig::new(MemorySize::Mib2, PageSize::Large2M);
        cfg.guests = vec!["g1.img".into()];
        cfg.shared_files = vec!["lorem1.txt".into(), "lorem2.txt".into()];
        let runner = VMRunner::new(cfg).unwrap();
        assert!(runner.shared_files().contains("lorem2.txt"));
        assert!(!runner.shared_files().contains("lorem3.txt"));
    }

    #[test]
    fn missing_image_fails_only_that_guest() {
        let mut cfg = VmConfig::new(MemorySize::Mib2, PageSize::Small4K);
        cfg.guests = vec!["/nonexistent/a.img".into(), "/nonexistent/b.img".into()];
        let results = VMRunner::new(cfg).unwrap().run();
        assert_eq!(results.len(), 2);
        // Without /dev/kvm this is an init failure, with it an image load failure.
        assert!(results.iter().all(|r| matches!(r.exit, GuestExit::Failed { .. })));
        assert_eq!(results[0].guest, "/nonexistent/a.img");
    }

    #[test]
    fn thread_names_follow_image_stem() {
        assert_eq!(thread_name(std::path::Path::new("guest1/guest1.img")), "vcpu-guest1");
    }
}
