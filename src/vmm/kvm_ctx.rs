use crate::error::{Error, Result};
use super::memory::GuestMem;
use super::paging::{self, PageTables};
use kvm_bindings::{kvm_regs, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use log::debug;


const RFLAGS_RESERVED: u64 = 0x2;
/// No irqchip is created, so nothing is ever delivered while IF is set.
const RFLAGS_IF: u64 = 0x200;


pub struct KvmContext {
    pub kvm: Kvm,
    pub vm: VmFd,
    pub vcpu: VcpuFd,
}


impl KvmContext {
    /// Open `/dev/kvm`, create the VM, install `gm` in slot 0 at guest
    /// physical 0 and create vCPU 0.
    pub fn new(gm: &GuestMem) -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::init("open /dev/kvm"))?;
        let vm = kvm.create_vm().map_err(Error::init("KVM_CREATE_VM"))?;

        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: gm.size(),
            userspace_addr: gm.host_address()?,
        };
        // SAFETY: the region is backed by `gm`'s mmap, which the caller keeps
        // alive for as long as this VM exists.
        unsafe { vm.set_user_memory_region(region) }
            .map_err(Error::init("KVM_SET_USER_MEMORY_REGION"))?;

        let vcpu = vm.create_vcpu(0).map_err(Error::init("KVM_CREATE_VCPU"))?;
        debug!("KVM API version {}, {} MiB mapped", kvm.get_api_version(), gm.size() >> 20);
        Ok(Self { kvm, vm, vcpu })
    }

    /// Enter 64-bit paged mode with flat segments, RIP at `entry` and the
    /// stack at the top of guest memory.
    pub fn configure_vcpu(&self, tables: &PageTables, entry: u64, stack_top: u64) -> Result<()> {
        let mut sregs = self.vcpu.get_sregs().map_err(Error::init("KVM_GET_SREGS"))?;
        sregs.cr3 = tables.regs.cr3;
        sregs.cr4 = tables.regs.cr4;
        sregs.cr0 = tables.regs.cr0;
        sregs.efer = tables.regs.efer;

        let data = paging::data_segment();
        sregs.cs = paging::code_segment();
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;
        self.vcpu.set_sregs(&sregs).map_err(Error::init("KVM_SET_SREGS"))?;

        let regs = kvm_regs {
            rflags: RFLAGS_RESERVED | RFLAGS_IF,
            rip: entry,
            rsp: stack_top,
            ..Default::default()
        };
        self.vcpu.set_regs(&regs).map_err(Error::init("KVM_SET_REGS"))?;
        Ok(())
    }
}
