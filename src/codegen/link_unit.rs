//! Incremental multi-function compilation.
//!
//! A [`LinkUnit`] is open until it is handed to
//! [`Backend::translate_link_unit`](super::Backend::translate_link_unit). While
//! open, every add compiles against the unit's shared resource registry, string
//! table and read-only segment, so a resource seen twice keeps its index across
//! functions. A failed add leaves the unit exactly as it was.

use crate::dsl::{CompiledMaterial, EnvironmentCall};

use super::compiler::{CodegenSession, CompileState, Entity};
use super::error::{CodegenError, CompileFailure, Message};
use super::lambda::Lambda;
use super::resources::ResourceEntry;
use super::target_code::TargetCode;
use super::types::TargetKind;
use crate::asset_store::ResourceKind;

pub struct LinkUnit<'s> {
    session: &'s CodegenSession,
    /// `None` once the unit has been finalized.
    state: Option<CompileState>,
}

fn closed() -> CodegenError {
    CodegenError::InvalidParameters("link unit already closed".into())
}

impl<'s> LinkUnit<'s> {
    pub(crate) fn new(session: &'s CodegenSession, state: CompileState) -> Self {
        Self {
            session,
            state: Some(state),
        }
    }

    /// Target kind fixed at creation, or `None` after finalizing.
    pub fn target(&self) -> Option<TargetKind> {
        self.state.as_ref().map(CompileState::target)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }

    pub fn function_count(&self) -> usize {
        self.state.as_ref().map_or(0, CompileState::function_count)
    }

    pub fn layout_count(&self) -> usize {
        self.state.as_ref().map_or(0, CompileState::layout_count)
    }

    /// Diagnostics collected by the adds so far.
    pub fn messages(&self) -> &[Message] {
        self.state.as_ref().map_or(&[][..], CompileState::messages)
    }

    /// Resources registered so far, in index order.
    pub fn resource_table(&self, kind: ResourceKind) -> &[ResourceEntry] {
        self.state.as_ref().map_or(&[][..], |s| s.registry().table(kind))
    }

    fn add(&mut self, build: impl FnOnce(&CompileState) -> Result<Entity, CodegenError>) -> Result<Option<usize>, CodegenError> {
        let session = self.session;
        let state = self.state.as_mut().ok_or_else(closed)?;
        let mut entity = match build(state) {
            Ok(entity) => entity,
            Err(e) => return Err(state.reject(e)),
        };
        state.compile_entity(&mut entity, session)
    }

    /// Add an environment function.
    ///
    /// # Returns
    /// Always `None`: environment functions capture no parameters.
    pub fn add_environment(&mut self, call: &EnvironmentCall, name: &str) -> Result<Option<usize>, CodegenError> {
        self.add(|_| Entity::environment(call, name))
    }

    /// Add the material field at `path` as function `name`.
    ///
    /// # Returns
    /// The index of the argument block layout created for the material's
    /// parameters, or `None` if it has none.
    pub fn add_material_expression(
        &mut self,
        material: &CompiledMaterial,
        path: &str,
        name: &str,
    ) -> Result<Option<usize>, CodegenError> {
        self.add(|state| Entity::expression(material, path, name, state.options().compile_constants))
    }

    /// Add several fields of one material as a single switch function.
    pub fn add_switch_expressions(
        &mut self,
        material: &CompiledMaterial,
        paths: &[&str],
        name: &str,
    ) -> Result<Option<usize>, CodegenError> {
        self.add(|state| Entity::switch(material, paths, name, state.options().compile_constants))
    }

    /// Add the BSDF at `path` as the four functions `<name>_init`,
    /// `<name>_sample`, `<name>_evaluate` and `<name>_pdf`.
    pub fn add_material_df(
        &mut self,
        material: &CompiledMaterial,
        path: &str,
        name: &str,
    ) -> Result<Option<usize>, CodegenError> {
        let resolver = self.session.resolver();
        self.add(|state| Entity::distribution(material, path, name, resolver, state.options().compile_constants))
    }

    /// Add a fragment built by the caller.
    pub fn add_lambda(&mut self, lambda: Lambda) -> Result<Option<usize>, CodegenError> {
        self.add(|_| Entity::lambda(lambda))
    }

    pub(crate) fn finalize(&mut self) -> Result<TargetCode, CompileFailure> {
        let state = self.state.take().ok_or_else(|| CompileFailure::from(closed()))?;
        state.finish()
    }
}
