//! The mutation stages the pipeline runs, in order

use dynatrace_common::Result;

use crate::metadata::MetadataMutator;
use crate::oneagent::OneAgentMutator;
use crate::request::{MutationRequest, ReinvocationRequest};

/// One stage of the pod mutation pipeline
#[derive(Clone)]
pub enum Mutator {
    /// Code-module injection
    OneAgent(OneAgentMutator),
    /// Workload metadata enrichment
    Metadata(MetadataMutator),
}

impl Mutator {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::OneAgent(_) => "oneagent",
            Self::Metadata(_) => "metadata-enrichment",
        }
    }

    /// The stage applies to this request
    pub fn is_enabled(&self, request: &MutationRequest) -> bool {
        match self {
            Self::OneAgent(m) => m.is_enabled(request),
            Self::Metadata(m) => m.is_enabled(request),
        }
    }

    /// First admission
    pub async fn mutate(&self, request: &mut MutationRequest) -> Result<()> {
        match self {
            Self::OneAgent(m) => m.mutate(request),
            Self::Metadata(m) => m.mutate(request).await,
        }
    }

    /// Later admission of an already mutated pod; returns whether anything changed
    ///
    /// Workload metadata does not change after the first admission.
    pub fn reinvoke(&self, request: &mut ReinvocationRequest<'_>) -> Result<bool> {
        match self {
            Self::OneAgent(m) => m.reinvoke(request),
            Self::Metadata(_) => Ok(false),
        }
    }
}
