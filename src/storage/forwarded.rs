//! Forwarding Storage Provider
//!
//! Wraps a local provider so every capability call goes through the
//! forwarder. The helper rebuilds the same provider from the spec.

use super::ProviderSpec;
use crate::domain::ports::{
    FormatRequest, FormatResponse, Inventory, PrepareRequest, PrepareResponse, StorageProvider,
    StorageProviderRef,
};
use crate::error::Result;
use crate::pbin::{Forwarder, LocalHandler, Operation, ProviderCall};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub struct ForwardingProvider {
    spec: ProviderSpec,
    local: LocalHandler,
    name: String,
    forwarder: Arc<Forwarder>,
}

impl ForwardingProvider {
    pub fn new(spec: ProviderSpec, local: StorageProviderRef, forwarder: Arc<Forwarder>) -> Self {
        Self {
            spec,
            name: local.name(),
            local: LocalHandler::new(local),
            forwarder,
        }
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    async fn call<T: DeserializeOwned>(&self, op: Operation) -> Result<T> {
        let call = ProviderCall {
            spec: self.spec.clone(),
            op,
        };
        let request = self.forwarder.request(&call)?;
        self.forwarder.execute(&self.local, request).await?.decode()
    }
}

#[async_trait]
impl StorageProvider for ForwardingProvider {
    async fn scan(&self) -> Result<Inventory> {
        self.call(Operation::Scan).await
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse> {
        self.call(Operation::Prepare(request.clone())).await
    }

    async fn format(&self, request: &FormatRequest) -> Result<FormatResponse> {
        self.call(Operation::Format(request.clone())).await
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
