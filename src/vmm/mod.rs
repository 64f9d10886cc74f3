pub mod kvm_ctx;
pub mod memory;
pub mod paging;
pub mod boot;
pub mod devices;
pub mod event_loop;
pub mod run;
