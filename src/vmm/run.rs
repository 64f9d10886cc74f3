use crate::config::MachineConfig;
use crate::error::Result;
use crate::files::FileEngine;
use crate::types::RunResult;
use super::{boot, devices::{Console, FilePort, PortBus}, event_loop::VmLoop, kvm_ctx::KvmContext, memory::GuestMem, paging};
use log::info;
use std::path::Path;


/// A created machine with its image loaded, ready to run.
pub struct GuestMachine {
    pub gm: GuestMem,
    pub kvm: KvmContext,
}


impl GuestMachine {
    /// Memory, page tables, KVM VM and vCPU for `machine`.
    pub fn create(machine: &MachineConfig) -> Result<(Self, paging::PageTables)> {
        // 1) memória + tabelas de página
        let mut gm = GuestMem::create(machine.memory.bytes())?;
        let tables = paging::setup_page_tables(&gm.mem, gm.size(), machine.page_size)?;
        gm.set_page_table_root(tables.regs.cr3);

        // 2) KVM
        let kvm = KvmContext::new(&gm)?;
        Ok((Self { gm, kvm }, tables))
    }
}


pub fn run_vm(machine: &MachineConfig, image: &Path, engine: FileEngine, console: Console) -> Result<RunResult> {
    let (mut vm, tables) = GuestMachine::create(machine)?;

    // 3) imagem plana em 0, abaixo das tabelas
    let boot = boot::load_image(&vm.gm.mem, image, paging::PML4_START)?;
    vm.kvm.configure_vcpu(&tables, boot.entry.0, vm.gm.size())?;
    info!(
        "{}: {} bytes loaded, {} MiB, {:?} pages",
        image.display(),
        boot.image_len,
        vm.gm.size() >> 20,
        machine.page_size
    );

    // 4) loop até HLT/SHUTDOWN
    let ports = PortBus::new(machine, console, FilePort::new(engine));
    let mut vml = VmLoop::new(&mut vm.kvm.vcpu, &vm.gm, ports);
    let exit = vml.run_until_exit()?;

    Ok(RunResult {
        guest: image.display().to_string(),
        exit,
        exits_handled: vml.exits(),
        file_ops: vml.ports.file.ops(),
    })
}
