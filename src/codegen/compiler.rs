//! Compiler session, backend front door and the shared compile primitive.
//!
//! Every translation, single-function or link unit, goes through
//! [`CompileState::compile_entity`]. A single-function translation is a fresh
//! state with one entity that is finalized right away; a link unit keeps its
//! state open across several adds.

use std::sync::Arc;

use anyhow::Context;

use crate::asset_store::{ResourceKind, ResourceStore};
use crate::dsl::{CompiledMaterial, EnvironmentCall, MaterialParameter, Value};

use super::arg_layout::ArgBlockLayout;
use super::code_cache::{CacheKey, CachedCode, CodeCache, cache_key, distribution_cache_key};
use super::emit::TargetBackend;
use super::error::{CodegenError, CompileFailure, Message, OptionError};
use super::lambda::{DistributionFunction, Lambda, Roots};
use super::link_unit::LinkUnit;
use super::lower::{LowerContext, ModuleBuilder};
use super::options::BackendOptions;
use super::resolver::NameResolver;
use super::resources::{ResourceEntry, ResourceEnumerator, ResourceRegistry};
use super::target_code::{FunctionInfo, TargetCode, TargetCodeParts};
use super::types::{ExecutionContext, FunctionKind, TargetKind, UniformState};

/// Something that compiles into one or more entry points.
#[derive(Clone, Debug)]
pub(crate) enum Entity {
    Function { lambda: Lambda, kind: FunctionKind },
    Distribution(DistributionFunction),
}

fn check_name(name: &str) -> Result<(), CodegenError> {
    if name.is_empty() {
        return Err(CodegenError::InvalidParameters("function name must not be empty".into()));
    }
    Ok(())
}

impl Entity {
    pub(crate) fn environment(call: &EnvironmentCall, name: &str) -> Result<Self, CodegenError> {
        check_name(name)?;
        Ok(Entity::Function {
            lambda: Lambda::environment(call, name)?,
            kind: FunctionKind::Environment,
        })
    }

    pub(crate) fn expression(
        material: &CompiledMaterial,
        path: &str,
        name: &str,
        compile_constants: bool,
    ) -> Result<Self, CodegenError> {
        check_name(name)?;
        Ok(Entity::Function {
            lambda: Lambda::from_sub_expression(material, path, name, compile_constants)?,
            kind: FunctionKind::Lambda,
        })
    }

    pub(crate) fn switch(
        material: &CompiledMaterial,
        paths: &[&str],
        name: &str,
        compile_constants: bool,
    ) -> Result<Self, CodegenError> {
        check_name(name)?;
        let Some(first) = paths.first() else {
            return Err(CodegenError::InvalidParameters(format!(
                "switch function '{name}' needs at least one path"
            )));
        };
        let mut lambda = Lambda::new(name, ExecutionContext::for_path(first));
        lambda.into_switch();
        for path in paths {
            lambda.add_sub_expression(material, path, compile_constants)?;
        }
        Ok(Entity::Function {
            lambda,
            kind: FunctionKind::SwitchLambda,
        })
    }

    /// A material field compiled for one instance: object transforms and id are
    /// constants, so the material must not capture any parameters.
    pub(crate) fn uniform_expression(
        material: &CompiledMaterial,
        path: &str,
        name: &str,
        state: UniformState,
        compile_constants: bool,
    ) -> Result<Self, CodegenError> {
        check_name(name)?;
        let mut lambda = Lambda::from_sub_expression(material, path, name, compile_constants)?;
        if lambda.has_captured_parameters() {
            return Err(CodegenError::CapturedParameters(name.to_string()));
        }
        lambda.set_uniform_state(Some(state));
        Ok(Entity::Function {
            lambda,
            kind: FunctionKind::Lambda,
        })
    }

    /// Wrap a caller-built fragment. The form of its roots picks the kind.
    pub(crate) fn lambda(lambda: Lambda) -> Result<Self, CodegenError> {
        check_name(lambda.name())?;
        let kind = match lambda.roots() {
            Some(Roots::MultiRoot(_)) => FunctionKind::SwitchLambda,
            _ if lambda.context() == ExecutionContext::Environment => FunctionKind::Environment,
            _ => FunctionKind::Lambda,
        };
        Ok(Entity::Function { lambda, kind })
    }

    pub(crate) fn distribution(
        material: &CompiledMaterial,
        path: &str,
        name: &str,
        resolver: &dyn NameResolver,
        compile_constants: bool,
    ) -> Result<Self, CodegenError> {
        check_name(name)?;
        Ok(Entity::Distribution(DistributionFunction::from_material(
            material,
            path,
            name,
            resolver,
            compile_constants,
        )?))
    }

    fn name(&self) -> &str {
        match self {
            Entity::Function { lambda, .. } => lambda.name(),
            Entity::Distribution(df) => df.name(),
        }
    }

    fn describe(&self) -> String {
        let what = match self {
            Entity::Function {
                kind: FunctionKind::Environment,
                ..
            } => "environment function",
            Entity::Function {
                kind: FunctionKind::SwitchLambda,
                ..
            } => "switch function",
            Entity::Function { .. } => "lambda",
            Entity::Distribution(_) => "distribution function",
        };
        format!("{what} '{}'", self.name())
    }

    /// Names of the entry points this entity turns into, in emission order.
    fn function_names(&self) -> Vec<String> {
        match self {
            Entity::Function { lambda, .. } => vec![lambda.name().to_string()],
            Entity::Distribution(df) => FunctionKind::DF_ENTRIES
                .iter()
                .map(|(_, suffix)| format!("{}_{suffix}", df.name()))
                .collect(),
        }
    }

    fn main(&self) -> &Lambda {
        match self {
            Entity::Function { lambda, .. } => lambda,
            Entity::Distribution(df) => df.main(),
        }
    }

    fn is_empty(&self) -> bool {
        self.main().root_nodes().is_empty()
    }

    fn parameters(&self) -> &[MaterialParameter] {
        self.main().parameters()
    }

    fn argument_values(&self) -> Vec<Value> {
        self.parameters().iter().map(|p| p.value.clone()).collect()
    }

    fn enumerate(&mut self, enumerator: &mut ResourceEnumerator<'_>) {
        match self {
            Entity::Function { lambda, .. } => enumerator.enumerate_lambda(lambda),
            Entity::Distribution(df) => enumerator.enumerate_distribution(df),
        }
    }

    fn cache_key(&self, target: TargetKind, options: &BackendOptions) -> anyhow::Result<CacheKey> {
        match self {
            Entity::Function { lambda, .. } => cache_key(lambda, target, options),
            Entity::Distribution(df) => distribution_cache_key(df, target, options),
        }
    }
}

/// Accumulated lowering state of one compile: a link unit, or the one-entry unit
/// behind a single-function translation.
#[derive(Clone, Debug)]
pub(crate) struct CompileState {
    backend: TargetBackend,
    options: BackendOptions,
    use_ro_segment: bool,
    builder: ModuleBuilder,
    registry: ResourceRegistry,
    functions: Vec<FunctionInfo>,
    layouts: Vec<ArgBlockLayout>,
    block_values: Vec<Vec<Value>>,
    messages: Vec<Message>,
}

impl CompileState {
    pub(crate) fn new(target: TargetKind, options: &BackendOptions, link_unit: bool) -> Self {
        let backend = TargetBackend::new(target, options);
        Self {
            backend,
            options: options.clone(),
            use_ro_segment: backend.use_ro_segment(options, link_unit),
            builder: ModuleBuilder::new(options),
            registry: ResourceRegistry::new(),
            functions: Vec::new(),
            layouts: Vec::new(),
            block_values: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub(crate) fn target(&self) -> TargetKind {
        self.backend.target()
    }

    pub(crate) fn options(&self) -> &BackendOptions {
        &self.options
    }

    pub(crate) fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub(crate) fn layout_count(&self) -> usize {
        self.layouts.len()
    }

    pub(crate) fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub(crate) fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Record `error` as a diagnostic and hand it back.
    pub(crate) fn reject(&mut self, error: CodegenError) -> CodegenError {
        self.messages.push(Message::error(error.to_string()));
        error
    }

    pub(crate) fn failure(&mut self, error: CodegenError) -> CompileFailure {
        CompileFailure {
            error,
            messages: std::mem::take(&mut self.messages),
        }
    }

    /// Resolve the entity's resources against this state's registry.
    fn enumerate(&mut self, entity: &mut Entity, session: &CodegenSession) {
        let mut enumerator = ResourceEnumerator::new(&mut self.registry, session.store()).with_resolver(session.resolver());
        entity.enumerate(&mut enumerator);
    }

    /// Compile one entity into this state.
    ///
    /// # Returns
    /// The index of the argument block layout created for the entity's captured
    /// parameters, or `None` when it captures nothing. On failure the state is
    /// restored to what it was before the call; only the diagnostics remain.
    pub(crate) fn compile_entity(
        &mut self,
        entity: &mut Entity,
        session: &CodegenSession,
    ) -> Result<Option<usize>, CodegenError> {
        if entity.is_empty() {
            return Err(self.reject(CodegenError::EmptyFragment(entity.name().to_string())));
        }
        if let Entity::Function {
            lambda,
            kind: FunctionKind::Environment,
        } = entity
        {
            if lambda.has_captured_parameters() {
                return Err(self.reject(CodegenError::CapturedParameters(lambda.name().to_string())));
            }
        }
        for name in entity.function_names() {
            if self.builder.has_function(&name) {
                self.messages.push(Message::error(format!("function '{name}' is already defined in this unit")));
                return Err(CodegenError::BackendFailure(name));
            }
        }

        let builder = self.builder.clone();
        let registry = self.registry.clone();
        let functions = self.functions.len();
        let layouts = self.layouts.len();
        let messages = self.messages.len();

        match self.lower_entity(entity, session) {
            Ok(index) => {
                log::debug!(
                    "compiled {} for {} ({} function(s) in unit)",
                    entity.describe(),
                    self.target().as_str(),
                    self.functions.len()
                );
                Ok(index)
            }
            Err(e) => {
                self.builder = builder;
                self.registry = registry;
                self.functions.truncate(functions);
                self.layouts.truncate(layouts);
                self.block_values.truncate(layouts);
                log::warn!("compiling {} failed: {e:#}", entity.describe());
                if self.messages.len() == messages {
                    self.messages.push(Message::internal(format!(
                        "compiling {} failed: internal backend error",
                        entity.describe()
                    )));
                }
                Err(CodegenError::BackendFailure(entity.name().to_string()))
            }
        }
    }

    fn lower_entity(&mut self, entity: &mut Entity, session: &CodegenSession) -> anyhow::Result<Option<usize>> {
        self.enumerate(entity, session);

        let rules = self.backend.layout_rules();
        let block = if entity.main().has_captured_parameters() {
            let parameters = entity.parameters();
            let layout = ArgBlockLayout::build(parameters, rules)
                .with_context(|| format!("argument block layout of {}", entity.describe()))?;
            if self.options.map_strings_to_ids {
                let builder = &mut self.builder;
                for_each_parameter_string(parameters, &mut |s| {
                    builder.intern_string(s);
                });
            }
            let (index, offsets) = self.builder.declare_arg_block(parameters, &layout);
            Some((layout, index, offsets))
        } else {
            None
        };

        let cx = LowerContext {
            options: &self.options,
            resolver: session.resolver(),
            use_ro_segment: self.use_ro_segment,
            rules,
        };
        let arg_block = block.as_ref().map(|(_, index, offsets)| (*index, offsets.as_slice()));
        let first = self.builder.function_count();
        match &*entity {
            Entity::Function { lambda, kind } => {
                self.builder.lower_lambda(cx, lambda, *kind, arg_block, &mut self.messages)?
            }
            Entity::Distribution(df) => self.builder.lower_distribution(cx, df, arg_block, &mut self.messages)?,
        }

        let layout_index = block.map(|(layout, ..)| {
            self.layouts.push(layout);
            self.block_values.push(entity.argument_values());
            self.layouts.len() - 1
        });
        for func in &self.builder.module().functions[first..] {
            self.functions.push(FunctionInfo {
                name: func.name.clone(),
                kind: func.kind,
                arg_block_index: layout_index,
                prototype: String::new(),
            });
        }
        Ok(layout_index)
    }

    fn resource_tables(&self) -> [Vec<ResourceEntry>; 3] {
        ResourceKind::ALL.map(|kind| self.registry.table(kind).to_vec())
    }

    /// Emit everything accumulated so far into one artifact.
    pub(crate) fn finish(mut self) -> Result<TargetCode, CompileFailure> {
        if self.functions.is_empty() {
            let error = self.reject(CodegenError::LinkFailed("no functions were added".into()));
            return Err(self.failure(error));
        }

        let resources = self.resource_tables();
        let module = self.builder.finish();
        let ro_segment = module.ro_segment.clone();
        let strings = module.strings.clone();
        let state_usage = module.state_usage;
        let emitted = match self.backend.emit(module) {
            Ok(emitted) => emitted,
            Err(e) => {
                log::warn!("emitting {} code failed: {e:#}", self.backend.target().as_str());
                self.messages.push(Message::internal(format!("{e:#}")));
                let names: Vec<&str> = self.functions.iter().map(|f| f.name.as_str()).collect();
                let error = CodegenError::BackendFailure(names.join(", "));
                return Err(CompileFailure {
                    error,
                    messages: self.messages,
                });
            }
        };
        for (info, prototype) in self.functions.iter_mut().zip(emitted.prototypes) {
            info.prototype = prototype;
        }

        log::info!(
            "finalized {} function(s) for {}: {} code byte(s), {} RO byte(s), {} layout(s)",
            self.functions.len(),
            self.backend.target().as_str(),
            emitted.body.len(),
            ro_segment.len(),
            self.layouts.len()
        );
        let parts = TargetCodeParts {
            target: self.backend.target(),
            functions: self.functions,
            body: emitted.body,
            ro_segment,
            strings,
            strings_mapped: self.options.map_strings_to_ids,
            layouts: self.layouts,
            resources,
            messages: self.messages,
            state_usage,
        };
        Ok(TargetCode::assemble(parts, &self.block_values))
    }

    /// Rebuild an artifact from a cache entry, reusing this state's resource
    /// tables and the entity's current argument values.
    ///
    /// String arguments are not part of the key, so any the cached table lacks
    /// are appended to it; ids already baked into the code stay valid.
    fn restore_cached(self, cached: &CachedCode, entity: &Entity) -> TargetCode {
        let resources = self.resource_tables();
        let mut strings = cached.strings.clone();
        if self.options.map_strings_to_ids {
            for_each_parameter_string(entity.parameters(), &mut |s| {
                if strings.is_empty() {
                    strings.push(String::new());
                }
                if !strings.iter().any(|known| known == s) {
                    strings.push(s.to_string());
                }
            });
        }
        let parts = TargetCodeParts {
            target: self.backend.target(),
            functions: cached.functions.clone(),
            body: cached.body.clone(),
            ro_segment: cached.ro_segment.clone(),
            strings,
            strings_mapped: self.options.map_strings_to_ids,
            layouts: cached.layout.iter().cloned().collect(),
            resources,
            messages: self.messages,
            state_usage: cached.state_usage,
        };
        TargetCode::assemble(parts, &[entity.argument_values()])
    }
}

fn for_each_parameter_string(parameters: &[MaterialParameter], f: &mut dyn FnMut(&str)) {
    for p in parameters {
        p.value.visit(&mut |v| {
            if let Value::String(s) = v {
                f(s);
            }
        });
    }
}

fn cached_code(code: &TargetCode) -> CachedCode {
    CachedCode {
        body: code.body().clone(),
        functions: code.functions().to_vec(),
        ro_segment: code.ro_segment().to_vec(),
        strings: code.string_constants().to_vec(),
        layout: code.layouts().first().cloned(),
        state_usage: code.state_usage(),
    }
}

/// Owns the collaborators every compile needs: the resource store, the name
/// resolver and the code cache.
pub struct CodegenSession {
    store: Arc<dyn ResourceStore + Send + Sync>,
    resolver: Arc<dyn NameResolver + Send + Sync>,
    cache: Arc<CodeCache>,
}

impl CodegenSession {
    pub fn new(store: Arc<dyn ResourceStore + Send + Sync>, resolver: Arc<dyn NameResolver + Send + Sync>) -> Self {
        Self {
            store,
            resolver,
            cache: Arc::new(CodeCache::new()),
        }
    }

    /// Share `cache` with other sessions.
    pub fn with_cache(mut self, cache: Arc<CodeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn store(&self) -> &dyn ResourceStore {
        self.store.as_ref()
    }

    pub fn resolver(&self) -> &dyn NameResolver {
        self.resolver.as_ref()
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    /// A backend for `target` with default options.
    pub fn backend(&self, target: TargetKind) -> Backend<'_> {
        Backend {
            session: self,
            target,
            options: BackendOptions::default(),
            use_cache: true,
        }
    }
}

/// Compiles fragments for one target kind.
pub struct Backend<'s> {
    session: &'s CodegenSession,
    target: TargetKind,
    options: BackendOptions,
    use_cache: bool,
}

impl<'s> Backend<'s> {
    pub fn target(&self) -> TargetKind {
        self.target
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    pub fn with_options(mut self, options: BackendOptions) -> Result<Self, OptionError> {
        options.check()?;
        self.options = options;
        Ok(self)
    }

    /// Whether single-function translations consult the session's code cache.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        self.options.set_option(name, value)
    }

    /// Compile an environment function (color or texture-return result, no
    /// captured parameters).
    pub fn translate_environment(&self, call: &EnvironmentCall, name: &str) -> Result<Arc<TargetCode>, CompileFailure> {
        self.translate_single(Entity::environment(call, name)?)
    }

    /// Compile a fragment built by the caller.
    pub fn translate_lambda(&self, lambda: Lambda) -> Result<Arc<TargetCode>, CompileFailure> {
        self.translate_single(Entity::lambda(lambda)?)
    }

    pub fn translate_material_expression(
        &self,
        material: &CompiledMaterial,
        path: &str,
        name: &str,
    ) -> Result<Arc<TargetCode>, CompileFailure> {
        let entity = Entity::expression(material, path, name, self.options.compile_constants)?;
        self.translate_single(entity)
    }

    /// Compile several fields of one material into a single switch function.
    pub fn translate_material_expressions(
        &self,
        material: &CompiledMaterial,
        paths: &[&str],
        name: &str,
    ) -> Result<Arc<TargetCode>, CompileFailure> {
        let entity = Entity::switch(material, paths, name, self.options.compile_constants)?;
        self.translate_single(entity)
    }

    /// Compile the field at `path` for a single instance, with the object
    /// transforms and id folded in as constants.
    ///
    /// Fails with [`CodegenError::CapturedParameters`] when the material has
    /// class-compiled parameters.
    pub fn translate_material_expression_uniform_state(
        &self,
        material: &CompiledMaterial,
        path: &str,
        name: &str,
        state: UniformState,
    ) -> Result<Arc<TargetCode>, CompileFailure> {
        let entity = Entity::uniform_expression(material, path, name, state, self.options.compile_constants)?;
        self.translate_single(entity)
    }

    pub fn translate_material_df(
        &self,
        material: &CompiledMaterial,
        path: &str,
        name: &str,
    ) -> Result<Arc<TargetCode>, CompileFailure> {
        let entity = Entity::distribution(
            material,
            path,
            name,
            self.session.resolver(),
            self.options.compile_constants,
        )?;
        self.translate_single(entity)
    }

    /// An open link unit using this backend's target and a snapshot of its options.
    pub fn create_link_unit(&self) -> LinkUnit<'s> {
        LinkUnit::new(self.session, CompileState::new(self.target, &self.options, true))
    }

    /// Close `unit` and emit everything added to it as one artifact.
    ///
    /// A unit created for another target kind is rejected and stays open.
    pub fn translate_link_unit(&self, unit: &mut LinkUnit<'_>) -> Result<Arc<TargetCode>, CompileFailure> {
        if let Some(target) = unit.target().filter(|t| *t != self.target) {
            return Err(CompileFailure::from(CodegenError::InvalidParameters(format!(
                "link unit was created for {}, not {}",
                target.as_str(),
                self.target.as_str()
            ))));
        }
        unit.finalize().map(Arc::new)
    }

    fn translate_single(&self, mut entity: Entity) -> Result<Arc<TargetCode>, CompileFailure> {
        let mut state = CompileState::new(self.target, &self.options, false);
        let key = if self.use_cache {
            state.enumerate(&mut entity, self.session);
            match entity.cache_key(self.target, &self.options) {
                Ok(key) => {
                    if let Some(hit) = self.session.cache.lookup(&key) {
                        return Ok(Arc::new(state.restore_cached(&hit, &entity)));
                    }
                    Some(key)
                }
                Err(e) => {
                    log::warn!("compiling {} without the code cache: {e:#}", entity.describe());
                    None
                }
            }
        } else {
            None
        };

        if let Err(e) = state.compile_entity(&mut entity, self.session) {
            return Err(state.failure(e));
        }
        let code = state.finish()?;
        if let Some(key) = key {
            self.session.cache.insert(key, cached_code(&code));
        }
        Ok(Arc::new(code))
    }
}
