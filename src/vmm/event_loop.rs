use crate::error::{Error, Result};
use crate::types::GuestExit;
use super::devices::PortBus;
use super::memory::GuestMem;
use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{debug, info, warn};


/// Drives one vCPU until it halts, shuts down or fails.
pub struct VmLoop<'a> {
    vcpu: &'a mut VcpuFd,
    gm: &'a GuestMem,
    pub ports: PortBus,
    exits: u64,
}


/// What one exit did to the loop.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Stop(GuestExit),
}


impl<'a> VmLoop<'a> {
    pub fn new(vcpu: &'a mut VcpuFd, gm: &'a GuestMem, ports: PortBus) -> Self {
        Self { vcpu, gm, ports, exits: 0 }
    }

    /// Exits handled so far.
    pub fn exits(&self) -> u64 {
        self.exits
    }

    /// Resume the vCPU until a terminal exit. Each exit is handled exactly
    /// once; `KVM_RUN` itself blocks until the next one.
    pub fn run_until_exit(&mut self) -> Result<GuestExit> {
        loop {
            if let Step::Stop(exit) = self.step()? {
                return Ok(exit);
            }
        }
    }

    fn step(&mut self) -> Result<Step> {
        let exit = self.vcpu.run().map_err(Error::Run)?;
        self.exits += 1;
        let step = match exit {
            VcpuExit::IoOut(port, data) => {
                self.ports.io_out(port, data, self.gm);
                Step::Continue
            }
            VcpuExit::IoIn(port, data) => {
                self.ports.io_in(port, data);
                Step::Continue
            }
            VcpuExit::Hlt => {
                info!("KVM_EXIT_HLT");
                Step::Stop(GuestExit::Halted)
            }
            VcpuExit::Shutdown => {
                warn!("KVM_EXIT_SHUTDOWN");
                Step::Stop(GuestExit::Shutdown)
            }
            VcpuExit::InternalError => {
                let suberror = self.internal_suberror();
                warn!("KVM_EXIT_INTERNAL_ERROR: suberror = {:#x}", suberror);
                Step::Stop(GuestExit::InternalError { suberror })
            }
            VcpuExit::FailEntry(reason, cpu) => {
                warn!("KVM_EXIT_FAIL_ENTRY on cpu {}: reason = {:#x}", cpu, reason);
                Step::Stop(GuestExit::FailEntry { reason })
            }
            other => {
                debug!("unhandled exit reason: {:?}", other);
                Step::Continue
            }
        };
        Ok(step)
    }

    fn internal_suberror(&mut self) -> u32 {
        let run = self.vcpu.get_kvm_run();
        // SAFETY: KVM filled the `internal` member because the exit reason
        // was KVM_EXIT_INTERNAL_ERROR.
        unsafe { run.__bindgen_anon_1.internal.suberror }
    }
}
