//! Per-provider initialisation.
//!
//! Failures are logged with the provider's name and type and then swallowed:
//! a provider that fails to initialise simply contributes nothing until a
//! later apply succeeds.

use crate::observability::metrics;
use crate::provider::{Provider, ProviderType, VehicleType};

/// Log tag for a provider's initialisation. Compatible providers share one
/// tag whatever they hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitTag {
    Proxy,
    Rule,
    Compatible,
}

impl InitTag {
    fn of<P: Provider + ?Sized>(pv: &P) -> Self {
        match (pv.vehicle_type(), pv.provider_type()) {
            (VehicleType::Compatible, _) => InitTag::Compatible,
            (_, ProviderType::Proxy) => InitTag::Proxy,
            (_, ProviderType::Rule) => InitTag::Rule,
        }
    }
}

const INITIAL_FAILURE: &[(InitTag, &str)] = &[
    (InitTag::Proxy, "initial proxy provider"),
    (InitTag::Rule, "initial rule provider"),
    (InitTag::Compatible, "initial Compatible provider"),
];

fn failure_template(tag: InitTag) -> &'static str {
    INITIAL_FAILURE
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, template)| *template)
        .unwrap_or("initial provider")
}

/// Initialise a managed provider. Compatible providers are skipped.
pub async fn load_provider<P: Provider + ?Sized>(pv: &P) {
    if !pv.vehicle_type().is_managed() {
        return;
    }
    tracing::info!(provider = %pv.name(), "Start initial provider {}", pv.name());
    initialise(pv).await;
}

/// Run the compatibility pass for a provider backed by an inline source.
/// Managed providers are skipped; they were handled by [`load_provider`].
pub async fn init_compatible<P: Provider + ?Sized>(pv: &P) {
    if pv.vehicle_type().is_managed() {
        return;
    }
    tracing::info!(provider = %pv.name(), "Start initial Compatible provider {}", pv.name());
    initialise(pv).await;
}

async fn initialise<P: Provider + ?Sized>(pv: &P) {
    let ok = match pv.initial().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                provider = %pv.name(),
                provider_type = %pv.provider_type(),
                error = %e,
                "{} {} error",
                failure_template(InitTag::of(pv)),
                pv.name()
            );
            false
        }
    };
    metrics::record_provider_init(pv.provider_type(), ok);
}
