//! Per-compilation context and phase orchestration.
//!
//! One `Context` owns one compilation unit. The phases run sequentially on
//! the caller's thread; there is no shared mutable state between phases
//! beyond the method-local IR being rewritten, so a driver may run many
//! contexts on parallel workers. Everything the compilation allocated is
//! released when the context is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::ir::Graph;
use crate::lir::emit::emit_code;
use crate::lir::generator::generate_lir;
use crate::lir::stackalloc::allocate_stack_slots;
use crate::lir::FrameMap;
use crate::result::{CodegenError, CodegenResult};
use crate::runtime::{CompiledCode, RuntimeCaps};
use crate::settings::CoreConfig;

/// Cooperative cancellation token, polled at block boundaries by every
/// phase. Cancelling abandons the compilation without observable effect;
/// completed compilations are never affected.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Request cancellation. Safe from any thread.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome of driving one compilation to the end.
#[derive(Debug)]
pub enum Compilation {
    /// The artifact, ready for `RuntimeCaps::install_code`.
    Finished(CompiledCode),
    /// Cancelled mid-flight; all resources released, nothing observable.
    Abandoned,
}

/// One compilation unit: configuration, cancellation, and the pipeline.
pub struct Context {
    config: CoreConfig,
    cancel: CancelToken,
}

impl Context {
    pub fn new(config: CoreConfig) -> Context {
        Context {
            config,
            cancel: CancelToken::new(),
        }
    }

    /// A token the driver can hold to cancel this compilation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Run generation, stack-slot allocation, and emission over a
    /// scheduled graph. Errors surface whole-compilation; cancellation
    /// yields the neutral `Abandoned` outcome.
    pub fn compile(&self, graph: &Graph, caps: &dyn RuntimeCaps) -> CodegenResult<Compilation> {
        let result = self.compile_inner(graph, caps);
        match result {
            Ok(code) => Ok(Compilation::Finished(code)),
            Err(CodegenError::Cancelled) => {
                debug!("compilation abandoned by cancellation");
                Ok(Compilation::Abandoned)
            }
            Err(e) => Err(e),
        }
    }

    fn compile_inner(&self, graph: &Graph, caps: &dyn RuntimeCaps) -> CodegenResult<CompiledCode> {
        let mut frame = FrameMap::new(self.config.word_size);

        let mut lir = generate_lir(graph, &mut frame, caps, &self.config, &self.cancel)?;
        lir.trace_dump("after generation");

        allocate_stack_slots(&mut lir, &mut frame, &self.cancel)?;
        lir.trace_dump("after stack allocation");

        // The frame is final from here on; emission only reads it.
        frame.freeze();

        emit_code(&lir, &frame, caps, &self.config, &self.cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Graph, NodeData};
    use crate::runtime::testing::TestRuntime;

    fn void_graph() -> Graph {
        let mut g = Graph::new();
        let b0 = g.create_block();
        g.append(b0, NodeData::Return { value: None });
        g
    }

    #[test]
    fn void_method_compiles_to_frame_setup_and_return() {
        let ctx = Context::new(CoreConfig::default());
        let caps = TestRuntime::default();
        match ctx.compile(&void_graph(), &caps).unwrap() {
            Compilation::Finished(code) => {
                let hex: String = code.code.iter().map(|b| format!("{:02X}", b)).collect();
                assert_eq!(hex, "55488BEC488BE55DC3");
                assert_eq!(code.frame_size, 0);
                assert!(caps.install_code(&code).is_ok());
            }
            Compilation::Abandoned => panic!("not cancelled"),
        }
    }

    #[test]
    fn cancellation_yields_abandoned_not_error() {
        let ctx = Context::new(CoreConfig::default());
        ctx.cancel_token().cancel();
        let caps = TestRuntime::default();
        assert!(matches!(
            ctx.compile(&void_graph(), &caps).unwrap(),
            Compilation::Abandoned
        ));
    }
}
