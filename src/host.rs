//! In-memory compute backend
//!
//! Buffers are plain byte vectors and submissions are recorded instead of
//! executed. Used for dry runs, the planning CLI and tests. An optional
//! memory budget makes allocation failures reproducible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::binding::{BoundArguments, DispatchGeometry};
use crate::error::{ConvError, Result};
use crate::kernel::{CompilerOption, ComputeContext, ComputeQueue, KernelSource};
use crate::packing::Precision;
use crate::shape::Int4;

/// Host-memory buffer. Buffers allocated through a `HostContext` return
/// their bytes to its budget when dropped.
#[derive(Debug)]
pub struct HostBuffer {
    bytes: Vec<u8>,
    precision: Option<Precision>,
    ledger: Option<Arc<AtomicUsize>>,
}

impl HostBuffer {
    /// Untracked zero-filled buffer, e.g. for activations.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
            precision: None,
            ledger: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Element precision for linear storage, `None` for plain buffers.
    pub fn precision(&self) -> Option<Precision> {
        self.precision
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if let Some(ledger) = &self.ledger {
            ledger.fetch_sub(self.bytes.len(), Ordering::SeqCst);
        }
    }
}

/// A "built" kernel: the source and options it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKernel {
    pub source: KernelSource,
    pub options: Vec<CompilerOption>,
}

#[derive(Debug, Default)]
pub struct HostContext {
    budget: Option<usize>,
    allocated: Arc<AtomicUsize>,
    kernels_built: usize,
    sync_count: usize,
    fail_next_sync: bool,
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that refuses allocations past `bytes` live bytes.
    pub fn with_memory_budget(bytes: usize) -> Self {
        Self {
            budget: Some(bytes),
            ..Self::default()
        }
    }

    /// Bytes held by live buffers from this context.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn kernels_built(&self) -> usize {
        self.kernels_built
    }

    pub fn sync_count(&self) -> usize {
        self.sync_count
    }

    /// Make the next `synchronize_uploads` fail once.
    pub fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    fn allocate(&mut self, bytes: &[u8], precision: Option<Precision>) -> Result<HostBuffer> {
        let live = self.allocated_bytes();
        if let Some(budget) = self.budget {
            if live + bytes.len() > budget {
                return Err(ConvError::allocation(
                    "buffer",
                    format!(
                        "{} bytes requested, {} of {} in use",
                        bytes.len(),
                        live,
                        budget
                    ),
                ));
            }
        }
        self.allocated.fetch_add(bytes.len(), Ordering::SeqCst);
        Ok(HostBuffer {
            bytes: bytes.to_vec(),
            precision,
            ledger: Some(Arc::clone(&self.allocated)),
        })
    }
}

impl ComputeContext for HostContext {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn allocate_read_only_buffer(&mut self, bytes: &[u8]) -> Result<HostBuffer> {
        self.allocate(bytes, None)
    }

    fn allocate_linear_storage(&mut self, bytes: &[u8], precision: Precision) -> Result<HostBuffer> {
        if bytes.len() % precision.vec4_bytes() != 0 {
            return Err(ConvError::allocation(
                "linear storage",
                format!(
                    "{} bytes is not a whole number of {:?} vec4s",
                    bytes.len(),
                    precision
                ),
            ));
        }
        self.allocate(bytes, Some(precision))
    }

    fn build_kernel(
        &mut self,
        source: &KernelSource,
        options: &[CompilerOption],
    ) -> Result<HostKernel> {
        if source.entry_point.is_empty() || source.code.as_bytes().is_empty() {
            return Err(ConvError::CompilationFailure(
                "empty kernel source or entry point".to_string(),
            ));
        }
        self.kernels_built += 1;
        Ok(HostKernel {
            source: source.clone(),
            options: options.to_vec(),
        })
    }

    fn synchronize_uploads(&mut self) -> Result<()> {
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(ConvError::allocation("residency", "upload did not complete"));
        }
        self.sync_count += 1;
        Ok(())
    }
}

/// One recorded dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub entry_point: String,
    pub scalars: Vec<Int4>,
    pub geometry: DispatchGeometry,
    /// Byte sizes of weights, biases, src and dst.
    pub buffer_sizes: [usize; 4],
}

/// Records submissions and completes them immediately.
#[derive(Debug, Default)]
pub struct HostQueue {
    submissions: Vec<Submission>,
}

/// Index of a recorded submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCompletion(pub usize);

impl HostQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }
}

impl ComputeQueue<HostContext> for HostQueue {
    type Completion = HostCompletion;

    fn submit(
        &mut self,
        kernel: &HostKernel,
        args: &BoundArguments<'_, HostBuffer>,
        geometry: &DispatchGeometry,
    ) -> Result<HostCompletion> {
        let sizes = args.buffers().map(HostBuffer::len);
        self.submissions.push(Submission {
            entry_point: kernel.source.entry_point.clone(),
            scalars: args.scalars.clone(),
            geometry: *geometry,
            buffer_sizes: sizes,
        });
        Ok(HostCompletion(self.submissions.len() - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelCode;

    #[test]
    fn test_budget_released_on_drop() {
        let mut context = HostContext::with_memory_budget(64);
        let a = context.allocate_read_only_buffer(&[1; 48]).unwrap();
        assert_eq!(context.allocated_bytes(), 48);
        assert!(context.allocate_read_only_buffer(&[0; 32]).is_err());

        drop(a);
        assert_eq!(context.allocated_bytes(), 0);
        let b = context
            .allocate_linear_storage(&[0; 32], Precision::F32)
            .unwrap();
        assert_eq!(b.precision(), Some(Precision::F32));
    }

    #[test]
    fn test_linear_storage_needs_whole_vec4s() {
        let mut context = HostContext::new();
        assert!(context.allocate_linear_storage(&[0; 12], Precision::F32).is_err());
        assert!(context.allocate_linear_storage(&[0; 8], Precision::F16).is_ok());
    }

    #[test]
    fn test_empty_kernel_rejected() {
        let mut context = HostContext::new();
        let source = KernelSource {
            entry_point: "main".into(),
            code: KernelCode::SpirV(Vec::new()),
            specialization: Vec::new(),
        };
        assert!(matches!(
            context.build_kernel(&source, &[]),
            Err(ConvError::CompilationFailure(_))
        ));
        assert_eq!(context.kernels_built(), 0);
    }
}
