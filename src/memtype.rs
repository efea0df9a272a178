//! Copy routine selection by memory type.
//!
//! A benchmark or transfer harness names the memory kinds on both sides of a
//! copy; [`CopySelector::resolve_copy_function`] returns the routine to use,
//! binding the calling process to an accelerator first when one is involved.
//! Accelerator runtimes plug in through [`DeviceRuntime`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error};

use crate::error::{FastCopyError, Result};
use crate::memcpy::{CopyHint, transfer};

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    Host,
    /// Host memory registered for RDMA; copied like host memory.
    Rdma,
    Cuda,
    CudaManaged,
    Rocm,
    RocmManaged,
    Unknown,
}

impl MemoryType {
    pub const fn is_host(self) -> bool {
        matches!(self, MemoryType::Host)
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryType::Host => "host",
            MemoryType::Rdma => "rdma",
            MemoryType::Cuda => "cuda",
            MemoryType::CudaManaged => "cuda-managed",
            MemoryType::Rocm => "rocm",
            MemoryType::RocmManaged => "rocm-managed",
            MemoryType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// An accelerator runtime able to enumerate devices and copy between any
/// host and device addresses.
pub trait DeviceRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Number of visible devices.
    fn device_count(&self) -> Result<u32>;

    /// Bind the calling process to `index`.
    fn set_device(&self, index: u32) -> Result<()>;

    /// Copy `len` bytes and wait for completion.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for `len` bytes in the runtime's unified
    /// address space and must not overlap.
    unsafe fn copy(&self, dst: *mut u8, src: *const u8, len: usize);
}

/// A resolved copy routine.
#[derive(Clone)]
pub enum MemCopier {
    /// Host-to-host through the transfer engine.
    Host,
    Device(Arc<dyn DeviceRuntime>),
}

impl MemCopier {
    /// # Safety
    ///
    /// `src` readable and `dst` writable for `len` bytes in the copier's
    /// memory domain, not overlapping.
    pub unsafe fn copy(&self, dst: *mut u8, src: *const u8, len: usize) {
        match self {
            MemCopier::Host => transfer(dst, src, len, CopyHint::empty(), len),
            MemCopier::Device(runtime) => runtime.copy(dst, src, len),
        }
    }
}

impl fmt::Debug for MemCopier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemCopier::Host => f.write_str("Host"),
            MemCopier::Device(runtime) => f.debug_tuple("Device").field(&runtime.name()).finish(),
        }
    }
}

/// Memory kind that decides the copy routine: the common kind if both sides
/// agree, else whichever side is not host memory.
pub fn effective_memory_type(send: MemoryType, recv: MemoryType) -> MemoryType {
    if send == recv || !send.is_host() { send } else { recv }
}

const UNBOUND: u64 = u64::MAX;

/// A registered runtime and the group it is currently bound for.
struct Registered {
    runtime: Arc<dyn DeviceRuntime>,
    bound_group: AtomicU64,
}

impl Registered {
    fn new(runtime: Arc<dyn DeviceRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            bound_group: AtomicU64::new(UNBOUND),
        })
    }

    fn bind(&self, group_index: u32) -> Result<()> {
        let group = u64::from(group_index);
        if self.bound_group.load(Ordering::Relaxed) == group {
            return Ok(());
        }
        bind_device(self.runtime.as_ref(), group_index)?;
        self.bound_group.store(group, Ordering::Relaxed);
        Ok(())
    }
}

/// Maps memory kinds to copy routines. Accelerator kinds resolve only when a
/// runtime for them was registered.
#[derive(Clone, Default)]
pub struct CopySelector {
    cuda: Option<Arc<Registered>>,
    rocm: Option<Arc<Registered>>,
}

impl CopySelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cuda(mut self, runtime: Arc<dyn DeviceRuntime>) -> Self {
        self.cuda = Some(Registered::new(runtime));
        self
    }

    pub fn with_rocm(mut self, runtime: Arc<dyn DeviceRuntime>) -> Self {
        self.rocm = Some(Registered::new(runtime));
        self
    }

    /// Pick the copy routine for a `(send, recv)` pair.
    ///
    /// Accelerator kinds first bind the process to device
    /// `group_index % device_count`. A runtime is bound once per group; asking
    /// again for the same group reuses the binding. Binding is not
    /// synchronized, so concurrent first use with different group indices is
    /// last-writer-wins. Runtime failures while binding surface as
    /// [`FastCopyError::NoDevice`].
    pub fn resolve_copy_function(
        &self,
        send: MemoryType,
        recv: MemoryType,
        group_index: u32,
    ) -> Result<MemCopier> {
        let memory_type = effective_memory_type(send, recv);
        let runtime = match memory_type {
            MemoryType::Host | MemoryType::Rdma => return Ok(MemCopier::Host),
            MemoryType::Cuda | MemoryType::CudaManaged => self.cuda.as_ref(),
            MemoryType::Rocm | MemoryType::RocmManaged => self.rocm.as_ref(),
            MemoryType::Unknown => None,
        };

        let Some(registered) = runtime else {
            error!("memcpy was not defined for memory type {memory_type} or it is not supported");
            return Err(FastCopyError::UnsupportedMemoryType { memory_type });
        };

        registered.bind(group_index).inspect_err(|err| {
            error!("{}: {err}", registered.runtime.name());
        })?;
        Ok(MemCopier::Device(Arc::clone(&registered.runtime)))
    }
}

fn as_no_device(err: FastCopyError) -> FastCopyError {
    match err {
        FastCopyError::NoDevice { .. } => err,
        other => FastCopyError::no_device(other.to_string()),
    }
}

fn bind_device(runtime: &dyn DeviceRuntime, group_index: u32) -> Result<()> {
    let count = runtime.device_count().map_err(as_no_device)?;
    if count == 0 {
        return Err(FastCopyError::no_device("no visible devices"));
    }

    let index = group_index % count;
    runtime.set_device(index).map_err(as_no_device)?;
    debug!("{}: group {group_index} bound to device {index} of {count}", runtime.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockRuntime {
        devices: Result<u32>,
        fail_set: bool,
        selected: Mutex<Vec<u32>>,
    }

    impl MockRuntime {
        fn with_devices(n: u32) -> Arc<Self> {
            Arc::new(Self {
                devices: Ok(n),
                fail_set: false,
                selected: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeviceRuntime for MockRuntime {
        fn name(&self) -> &str {
            "mock"
        }

        fn device_count(&self) -> Result<u32> {
            match &self.devices {
                Ok(n) => Ok(*n),
                Err(err) => Err(FastCopyError::unsupported(err.to_string())),
            }
        }

        fn set_device(&self, index: u32) -> Result<()> {
            if self.fail_set {
                return Err(FastCopyError::invalid_config("device", index.to_string(), "set failed"));
            }
            self.selected.lock().unwrap().push(index);
            Ok(())
        }

        unsafe fn copy(&self, dst: *mut u8, src: *const u8, len: usize) {
            unsafe { core::ptr::copy_nonoverlapping(src, dst, len) }
        }
    }

    #[test]
    fn test_effective_memory_type() {
        use MemoryType::*;
        assert_eq!(effective_memory_type(Host, Host), Host);
        assert_eq!(effective_memory_type(Cuda, Host), Cuda);
        assert_eq!(effective_memory_type(Host, Rocm), Rocm);
        assert_eq!(effective_memory_type(Cuda, Rocm), Cuda);
        assert_eq!(effective_memory_type(Rdma, Host), Rdma);
    }

    #[test]
    fn test_host_resolves_to_transfer() {
        let selector = CopySelector::new();
        for (send, recv) in [
            (MemoryType::Host, MemoryType::Host),
            (MemoryType::Rdma, MemoryType::Rdma),
            (MemoryType::Host, MemoryType::Rdma),
        ] {
            let copier = selector.resolve_copy_function(send, recv, 0).unwrap();
            assert!(matches!(copier, MemCopier::Host));
        }

        let copier = selector
            .resolve_copy_function(MemoryType::Host, MemoryType::Host, 0)
            .unwrap();
        let src: Vec<u8> = (0..5000).map(|i| i as u8).collect();
        let mut dst = vec![0u8; 5000];
        unsafe { copier.copy(dst.as_mut_ptr(), src.as_ptr(), src.len()) };
        assert_eq!(dst, src);
    }

    #[test]
    fn test_device_round_robin() {
        let runtime = MockRuntime::with_devices(4);
        let selector = CopySelector::new().with_cuda(runtime.clone());

        for group in [0, 1, 5, 11] {
            let copier = selector
                .resolve_copy_function(MemoryType::Host, MemoryType::CudaManaged, group)
                .unwrap();
            assert!(matches!(copier, MemCopier::Device(_)));
        }
        assert_eq!(*runtime.selected.lock().unwrap(), vec![0, 1, 1, 3]);
    }

    #[test]
    fn test_same_group_binds_once() {
        let runtime = MockRuntime::with_devices(2);
        let selector = CopySelector::new().with_cuda(runtime.clone());
        let shared = selector.clone();

        for _ in 0..3 {
            selector
                .resolve_copy_function(MemoryType::Cuda, MemoryType::Cuda, 3)
                .unwrap();
        }
        shared
            .resolve_copy_function(MemoryType::CudaManaged, MemoryType::Host, 3)
            .unwrap();
        assert_eq!(*runtime.selected.lock().unwrap(), vec![1]);

        shared
            .resolve_copy_function(MemoryType::Cuda, MemoryType::Host, 4)
            .unwrap();
        assert_eq!(*runtime.selected.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_device_copy_goes_through_runtime() {
        let selector = CopySelector::new().with_rocm(MockRuntime::with_devices(1));
        let copier = selector
            .resolve_copy_function(MemoryType::Rocm, MemoryType::Rocm, 7)
            .unwrap();
        assert_eq!(format!("{copier:?}"), "Device(\"mock\")");

        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        unsafe { copier.copy(dst.as_mut_ptr(), src.as_ptr(), 4) };
        assert_eq!(dst, src);
    }

    #[test]
    fn test_no_device() {
        let selector = CopySelector::new().with_cuda(MockRuntime::with_devices(0));
        let err = selector
            .resolve_copy_function(MemoryType::Cuda, MemoryType::Cuda, 0)
            .unwrap_err();
        assert!(matches!(err, FastCopyError::NoDevice { .. }));

        let failing = Arc::new(MockRuntime {
            devices: Ok(2),
            fail_set: true,
            selected: Mutex::new(Vec::new()),
        });
        let selector = CopySelector::new().with_cuda(failing);
        let err = selector
            .resolve_copy_function(MemoryType::Cuda, MemoryType::Host, 3)
            .unwrap_err();
        assert_eq!(err.category(), "device");

        let broken = Arc::new(MockRuntime {
            devices: Err(FastCopyError::unsupported("driver")),
            fail_set: false,
            selected: Mutex::new(Vec::new()),
        });
        let selector = CopySelector::new().with_cuda(broken);
        let err = selector
            .resolve_copy_function(MemoryType::Cuda, MemoryType::Host, 0)
            .unwrap_err();
        assert!(matches!(err, FastCopyError::NoDevice { .. }));
        assert!(err.to_string().contains("driver"));
    }

    #[test]
    fn test_unsupported_kinds() {
        let selector = CopySelector::new();
        for kind in [MemoryType::Cuda, MemoryType::RocmManaged, MemoryType::Unknown] {
            let err = selector.resolve_copy_function(kind, MemoryType::Host, 0).unwrap_err();
            assert!(matches!(
                err,
                FastCopyError::UnsupportedMemoryType { memory_type } if memory_type == kind
            ));
        }
    }
}
