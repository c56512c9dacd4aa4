//! Registry of every conversation context of a running application.
//!
//! The registry owns its contexts in an ordered map keyed by `ContextId`, so
//! iteration follows (username, accountname, protocol) order and an identity
//! can never appear twice. It is an explicit value owned by the caller; there
//! is no global state.
//!
//! # Destruction rules
//!
//! - A context can only be forgotten while `Unconnected`
//! - The active fingerprint of a `Connected` context cannot be forgotten
//! - Forgetting the last fingerprint of an `Unconnected` context may cascade
//!   into forgetting the context itself, when the caller asks for it
//! - Dropping the registry forgets every context, running application data
//!   release functions

use std::collections::btree_map::{BTreeMap, Entry};

use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::context::{ConnectionState, Context, ContextError, ContextId};
use crate::fingerprint::Fingerprint;

/// What `forget_fingerprint` should act on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FingerprintSlot {
    /// The list anchor; forgetting it stands for forgetting the whole context
    Root,
    /// One real fingerprint entry
    Entry(Fingerprint),
}

/// What a forget operation actually removed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Forgotten {
    Nothing,
    Fingerprint,
    /// The context, along with any fingerprints it still held
    Context,
}

/// All contexts of one application, ordered by identity
pub struct ContextRegistry<A = ()> {
    config: RegistryConfig,
    contexts: BTreeMap<ContextId, Context<A>>,
}

impl<A> ContextRegistry<A> {
    /// Create an empty registry with the default config
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create an empty registry with a custom config
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            contexts: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Contexts in identity order
    pub fn contexts(&self) -> impl DoubleEndedIterator<Item = &Context<A>> + '_ {
        self.contexts.values()
    }

    pub fn contexts_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut Context<A>> + '_ {
        self.contexts.values_mut()
    }

    #[must_use]
    pub fn get(&self, id: &ContextId) -> Option<&Context<A>> {
        self.contexts.get(id)
    }

    pub fn get_mut(&mut self, id: &ContextId) -> Option<&mut Context<A>> {
        self.contexts.get_mut(id)
    }

    /// Look up a context without creating it
    pub fn find(
        &self,
        username: &str,
        accountname: &str,
        protocol: &str,
    ) -> Result<Option<&Context<A>>, ContextError> {
        let id = ContextId::new(username, accountname, protocol)?;
        Ok(self.contexts.get(&id))
    }

    /// Look up a context for modification without creating it
    pub fn find_mut(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
    ) -> Result<Option<&mut Context<A>>, ContextError> {
        let id = ContextId::new(username, accountname, protocol)?;
        Ok(self.contexts.get_mut(&id))
    }

    /// Look up a context, creating it if missing.
    ///
    /// `on_create` runs exactly once for a new context, before it is returned,
    /// so the caller can attach application data. The flag is true when the
    /// context was just created.
    pub fn find_or_create<F>(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
        on_create: F,
    ) -> Result<(&mut Context<A>, bool), ContextError>
    where
        F: FnOnce(&mut Context<A>),
    {
        self.find_context(username, accountname, protocol, true, on_create)?
            .ok_or(ContextError::UnknownContext)
    }

    /// Look up a context, creating it when `add_if_missing` is set.
    ///
    /// Returns `Ok(None)` only when the context does not exist and creation
    /// was not requested. Empty identity fields are rejected with
    /// `InvalidArgument` without touching the registry.
    pub fn find_context<F>(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
        add_if_missing: bool,
        on_create: F,
    ) -> Result<Option<(&mut Context<A>, bool)>, ContextError>
    where
        F: FnOnce(&mut Context<A>),
    {
        let id = ContextId::new(username, accountname, protocol)?;
        let full = self.contexts.len() >= self.config.max_contexts;
        let limits = self.config.context;

        match self.contexts.entry(id) {
            Entry::Occupied(entry) => Ok(Some((entry.into_mut(), false))),
            Entry::Vacant(_) if !add_if_missing => Ok(None),
            Entry::Vacant(_) if full => {
                Err(ContextError::ResourceExhausted("context registry is full"))
            }
            Entry::Vacant(entry) => {
                let context = Context::new(entry.key().clone(), limits);
                let context = entry.insert(context);
                debug!(target: "contexts", context = %context.id(), "new context");
                on_create(&mut *context);
                Ok(Some((context, true)))
            }
        }
    }

    /// Destroy an `Unconnected` context: its fingerprints, its key material
    /// and its application data.
    pub fn forget(&mut self, id: &ContextId) -> Result<(), ContextError> {
        let state = self
            .contexts
            .get(id)
            .ok_or(ContextError::UnknownContext)?
            .state();
        if state != ConnectionState::Unconnected {
            warn!(
                target: "contexts",
                context = %id,
                %state,
                "refusing to forget a context that is not unconnected"
            );
            return Err(ContextError::NotUnconnected(state));
        }

        if let Some(context) = self.contexts.remove(id) {
            context.destroy();
        }
        Ok(())
    }

    /// Forget a fingerprint, or with `FingerprintSlot::Root` the whole
    /// context.
    ///
    /// With `and_maybe_context` set, forgetting the last fingerprint of an
    /// `Unconnected` context also forgets the context. Without it, the root
    /// slot is left alone and `Forgotten::Nothing` is returned.
    pub fn forget_fingerprint(
        &mut self,
        id: &ContextId,
        slot: FingerprintSlot,
        and_maybe_context: bool,
    ) -> Result<Forgotten, ContextError> {
        let context = self
            .contexts
            .get_mut(id)
            .ok_or(ContextError::UnknownContext)?;

        match slot {
            FingerprintSlot::Root => {
                if !and_maybe_context {
                    return Ok(Forgotten::Nothing);
                }
                self.forget(id)?;
                Ok(Forgotten::Context)
            }
            FingerprintSlot::Entry(fingerprint) => {
                context.forget_fingerprint(&fingerprint)?;
                if and_maybe_context
                    && context.state() == ConnectionState::Unconnected
                    && context.fingerprints().is_empty()
                {
                    self.forget(id)?;
                    return Ok(Forgotten::Context);
                }
                Ok(Forgotten::Fingerprint)
            }
        }
    }

    /// Force every context to `Unconnected` and forget it
    pub fn forget_all(&mut self) {
        while let Some(mut entry) = self.contexts.first_entry() {
            entry.get_mut().force_disconnect();
            entry.remove().destroy();
        }
    }
}

impl<A> Default for ContextRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Drop for ContextRegistry<A> {
    fn drop(&mut self) {
        self.forget_all();
    }
}
