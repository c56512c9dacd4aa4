//! WASM bindings for browser environment
//!
//! Exposes a `ContextStore` handle to JavaScript. Each handle owns its own
//! registry; the caller keeps it alive for as long as the conversations exist
//! and calls `forgetAll` (or lets it be freed) on shutdown.
//!
//! Fingerprints cross the boundary as 20-byte `Uint8Array`s. Operations that
//! can be refused return `false` and log the reason to the console.

use wasm_bindgen::prelude::*;

use crate::context::{ConnectionState, Context, ContextError, ContextId};
use crate::fingerprint::Fingerprint;
use crate::registry::{ContextRegistry, FingerprintSlot, Forgotten};

#[wasm_bindgen]
extern "C" {
    /// Log to console (for debugging)
    #[wasm_bindgen(js_namespace = console, js_name = "log")]
    fn js_log(s: &str);
}

/// Initialize panic hook for better error messages
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

fn report(operation: &str, err: &ContextError) -> bool {
    js_log(&format!("[WASM] {} failed: {}", operation, err));
    false
}

fn parse_fingerprint(bytes: &[u8]) -> Result<Fingerprint, JsValue> {
    Fingerprint::try_from(bytes).map_err(|e| JsValue::from_str(&e.to_string()))
}

fn state_code(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Unconnected => 0,
        ConnectionState::Setup => 1,
        ConnectionState::Connected => 2,
    }
}

/// Caller-owned registry of conversation contexts
#[wasm_bindgen]
pub struct ContextStore {
    registry: ContextRegistry,
}

impl ContextStore {
    fn context_mut(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
    ) -> Result<&mut Context, ContextError> {
        self.registry
            .find_mut(username, accountname, protocol)?
            .ok_or(ContextError::UnknownContext)
    }
}

#[wasm_bindgen]
impl ContextStore {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        Self {
            registry: ContextRegistry::new(),
        }
    }

    /// Find a context, creating it when `create` is set.
    /// Returns true when a new context was created.
    #[wasm_bindgen(js_name = "findContext")]
    pub fn find_context(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
        create: bool,
    ) -> Result<bool, JsValue> {
        let found = self
            .registry
            .find_context(username, accountname, protocol, create, |_| {})
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        Ok(found.map_or(false, |(_, created)| created))
    }

    /// Number of contexts
    #[wasm_bindgen(js_name = "contextCount")]
    pub fn context_count(&self) -> usize {
        self.registry.len()
    }

    /// State of a context: 0 = not private, 1 = setting up, 2 = private.
    /// Returns `undefined` for unknown contexts.
    #[wasm_bindgen(js_name = "contextState")]
    pub fn context_state(&self, username: &str, accountname: &str, protocol: &str) -> Option<u8> {
        self.registry
            .find(username, accountname, protocol)
            .ok()
            .flatten()
            .map(|ctx| state_code(ctx.state()))
    }

    /// Record a fingerprint. Returns true when it was not known before.
    #[wasm_bindgen(js_name = "addFingerprint")]
    pub fn add_fingerprint(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
        fingerprint: &[u8],
    ) -> Result<bool, JsValue> {
        let fingerprint = parse_fingerprint(fingerprint)?;
        let context = self
            .context_mut(username, accountname, protocol)
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        let (_, created) = context
            .find_or_add_fingerprint(fingerprint)
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        Ok(created)
    }

    /// Human-readable fingerprints of a context, most recent first
    #[wasm_bindgen(js_name = "listFingerprints")]
    pub fn list_fingerprints(&self, username: &str, accountname: &str, protocol: &str) -> Vec<String> {
        match self.registry.find(username, accountname, protocol) {
            Ok(Some(ctx)) => ctx
                .fingerprints()
                .iter()
                .map(|entry| entry.fingerprint().to_string())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Set or clear (with `undefined`) a trust label
    #[wasm_bindgen(js_name = "setTrust")]
    pub fn set_trust(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
        fingerprint: &[u8],
        trust: Option<String>,
    ) -> Result<bool, JsValue> {
        let fingerprint = parse_fingerprint(fingerprint)?;
        let result = self
            .context_mut(username, accountname, protocol)
            .and_then(|ctx| ctx.set_trust(&fingerprint, trust.as_deref()));
        match result {
            Ok(known) => Ok(known),
            Err(e) => Ok(report("setTrust", &e)),
        }
    }

    #[wasm_bindgen(js_name = "getTrust")]
    pub fn get_trust(
        &self,
        username: &str,
        accountname: &str,
        protocol: &str,
        fingerprint: &[u8],
    ) -> Result<Option<String>, JsValue> {
        let fingerprint = parse_fingerprint(fingerprint)?;
        Ok(self
            .registry
            .find(username, accountname, protocol)
            .ok()
            .flatten()
            .and_then(|ctx| ctx.find_fingerprint(&fingerprint))
            .and_then(|entry| entry.trust().map(str::to_owned)))
    }

    /// Set or clear (with `undefined` or an empty array) the preshared secret
    #[wasm_bindgen(js_name = "setPresharedSecret")]
    pub fn set_preshared_secret(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
        secret: Option<Vec<u8>>,
    ) -> bool {
        let result = self
            .context_mut(username, accountname, protocol)
            .and_then(|ctx| ctx.set_preshared_secret(secret.as_deref()));
        match result {
            Ok(()) => true,
            Err(e) => report("setPresharedSecret", &e),
        }
    }

    #[wasm_bindgen(js_name = "forceSetup")]
    pub fn force_setup(&mut self, username: &str, accountname: &str, protocol: &str) -> bool {
        match self.context_mut(username, accountname, protocol) {
            Ok(ctx) => {
                ctx.force_setup();
                true
            }
            Err(e) => report("forceSetup", &e),
        }
    }

    #[wasm_bindgen(js_name = "forceDisconnect")]
    pub fn force_disconnect(&mut self, username: &str, accountname: &str, protocol: &str) -> bool {
        match self.context_mut(username, accountname, protocol) {
            Ok(ctx) => {
                ctx.force_disconnect();
                true
            }
            Err(e) => report("forceDisconnect", &e),
        }
    }

    /// Forget one fingerprint, cascading to the context when requested.
    /// Returns true if anything was removed.
    #[wasm_bindgen(js_name = "forgetFingerprint")]
    pub fn forget_fingerprint(
        &mut self,
        username: &str,
        accountname: &str,
        protocol: &str,
        fingerprint: &[u8],
        and_maybe_context: bool,
    ) -> Result<bool, JsValue> {
        let fingerprint = parse_fingerprint(fingerprint)?;
        let result = ContextId::new(username, accountname, protocol).and_then(|id| {
            self.registry.forget_fingerprint(
                &id,
                FingerprintSlot::Entry(fingerprint),
                and_maybe_context,
            )
        });
        match result {
            Ok(forgotten) => Ok(forgotten != Forgotten::Nothing),
            Err(e) => Ok(report("forgetFingerprint", &e)),
        }
    }

    /// Forget a context; refused unless it is not private
    #[wasm_bindgen(js_name = "forgetContext")]
    pub fn forget_context(&mut self, username: &str, accountname: &str, protocol: &str) -> bool {
        let result = ContextId::new(username, accountname, protocol)
            .and_then(|id| self.registry.forget(&id));
        match result {
            Ok(()) => true,
            Err(e) => report("forgetContext", &e),
        }
    }

    /// Disconnect and forget every context
    #[wasm_bindgen(js_name = "forgetAll")]
    pub fn forget_all(&mut self) {
        self.registry.forget_all();
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Get WASM module version (for verification)
#[wasm_bindgen(js_name = "getWasmVersion")]
pub fn get_wasm_version() -> String {
    concat!("otr-contexts-v", env!("CARGO_PKG_VERSION")).to_string()
}
