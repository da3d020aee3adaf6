//! Stanza routing through per-instance handler chains.
//!
//! An *instance* is a named routing target that owns one or more domain
//! patterns and three ordered handler chains:
//!
//! ```text
//!   stanza ──► resolve domain ──► PreDelivery ──► Conditional ──► Delivery
//!                  │ no match         (rewrite)      (filter)       (claim)
//!                  ▼
//!               bounce
//! ```
//!
//! Domain resolution prefers an exact hostname, then the first wildcard in
//! registration order, then the uplink instance if one is set. Every stanza
//! is either delivered, bounced back to its sender, or (for error stanzas and
//! unclaimed stanzas) dropped with a warning.
//!
//! The registry is an immutable value behind an `Arc`. Registration and
//! reload build a new registry and swap it in, so a dispatch in flight keeps
//! the snapshot it started with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, instrument, warn};

use crate::error::StanzaErrorCondition;
use crate::metrics;
use crate::stanza::Stanza;
use crate::XmppError;

/// The three ordered handler phases of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Transforms that may rewrite the stanza
    PreDelivery,
    /// Filters that may reject the stanza
    Conditional,
    /// Terminal handlers; the first to return `Done` consumes the stanza
    Delivery,
}

impl Phase {
    const ALL: [Phase; 3] = [Phase::PreDelivery, Phase::Conditional, Phase::Delivery];

    fn index(self) -> usize {
        match self {
            Phase::PreDelivery => 0,
            Phase::Conditional => 1,
            Phase::Delivery => 2,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::PreDelivery => write!(f, "pre-delivery"),
            Phase::Conditional => write!(f, "conditional"),
            Phase::Delivery => write!(f, "delivery"),
        }
    }
}

/// What a handler did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// Not mine; continue with the next handler
    Pass,
    /// Consumed; stop
    Done,
    /// Stop and treat the stanza as rejected
    Last,
    /// Stop and treat the stanza as failed
    Error,
    /// Remove this handler permanently, then continue
    Unregister,
}

/// A stanza in flight through an instance's chains.
#[derive(Debug)]
pub struct Packet {
    /// The stanza; pre-delivery handlers may rewrite it
    pub stanza: Stanza,
    instance: String,
    source: Option<String>,
}

impl Packet {
    /// Packet for `stanza` routed to `instance`.
    pub fn new(stanza: Stanza, instance: impl Into<String>, source: Option<&str>) -> Self {
        Self {
            stanza,
            instance: instance.into(),
            source: source.map(str::to_string),
        }
    }

    /// Id of the instance the stanza was routed to.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Instance that injected the stanza, if it did not come off a socket.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

/// A routing handler.
///
/// Handlers are synchronous; dispatch never suspends. Anything slow belongs
/// behind a channel.
pub trait Handler: Send + Sync {
    /// Process a packet.
    fn handle(&self, packet: &mut Packet) -> HandlerResult;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Handler for F
where
    F: Fn(&mut Packet) -> HandlerResult + Send + Sync,
{
    fn handle(&self, packet: &mut Packet) -> HandlerResult {
        self(packet)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

struct HandlerEntry {
    handler: Arc<dyn Handler>,
    retired: AtomicBool,
}

impl HandlerEntry {
    fn new(handler: Arc<dyn Handler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            retired: AtomicBool::new(false),
        })
    }

    fn is_live(&self) -> bool {
        !self.retired.load(Ordering::Acquire)
    }
}

/// A domain pattern an instance answers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    /// One hostname
    Exact(String),
    /// Any subdomain of the suffix (`*.example.com`), not the suffix itself
    Subdomains(String),
    /// Every domain (`*`)
    Any,
}

impl DomainPattern {
    /// Parse `host`, `*.suffix` or `*`. Hostnames are lowercased.
    pub fn parse(pattern: &str) -> Result<Self, XmppError> {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*" {
            return Ok(DomainPattern::Any);
        }
        let (host, wildcard) = match pattern.strip_prefix("*.") {
            Some(suffix) => (suffix.to_string(), true),
            None => (pattern, false),
        };
        if host.is_empty()
            || host.starts_with('.')
            || host.ends_with('.')
            || host
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '*' | '@' | '/'))
        {
            return Err(XmppError::config(format!("invalid domain pattern '{}'", host)));
        }
        Ok(if wildcard {
            DomainPattern::Subdomains(host)
        } else {
            DomainPattern::Exact(host)
        })
    }

    /// Whether `domain` (lowercase) matches.
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainPattern::Exact(host) => host == domain,
            DomainPattern::Subdomains(suffix) => domain
                .strip_suffix(suffix.as_str())
                .is_some_and(|head| head.len() > 1 && head.ends_with('.')),
            DomainPattern::Any => true,
        }
    }
}

impl std::fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainPattern::Exact(host) => write!(f, "{}", host),
            DomainPattern::Subdomains(suffix) => write!(f, "*.{}", suffix),
            DomainPattern::Any => write!(f, "*"),
        }
    }
}

/// A routing target with its handler chains.
#[derive(Clone)]
pub struct Instance {
    id: String,
    patterns: Vec<DomainPattern>,
    chains: [Vec<Arc<HandlerEntry>>; 3],
}

impl Instance {
    /// Instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Domain patterns, in registration order.
    pub fn patterns(&self) -> &[DomainPattern] {
        &self.patterns
    }

    /// Number of live handlers in `phase`.
    pub fn handler_count(&self, phase: Phase) -> usize {
        self.chains[phase.index()].iter().filter(|e| e.is_live()).count()
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("patterns", &self.patterns)
            .field("pre_delivery", &self.handler_count(Phase::PreDelivery))
            .field("conditional", &self.handler_count(Phase::Conditional))
            .field("delivery", &self.handler_count(Phase::Delivery))
            .finish()
    }
}

/// An immutable, validated set of instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    instances: Vec<Instance>,
    exact: HashMap<String, usize>,
    /// (pattern, instance index), in registration order
    wildcards: Vec<(DomainPattern, usize)>,
    uplink: Option<usize>,
}

impl InstanceRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Find the instance for `domain`: exact hostname first, then the first
    /// matching wildcard, then the uplink.
    pub fn resolve(&self, domain: &str) -> Option<&Instance> {
        let domain = domain.to_ascii_lowercase();
        if let Some(&idx) = self.exact.get(&domain) {
            return self.instances.get(idx);
        }
        self.wildcards
            .iter()
            .find(|(pattern, _)| pattern.matches(&domain))
            .map(|&(_, idx)| idx)
            .or(self.uplink)
            .and_then(|idx| self.instances.get(idx))
    }

    /// The instance that takes domains nothing else matches.
    pub fn uplink(&self) -> Option<&Instance> {
        self.uplink.and_then(|idx| self.instances.get(idx))
    }

    /// Look up an instance by id.
    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// All instances, in registration order.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    fn instance_id(&self, idx: usize) -> Option<&str> {
        self.instances.get(idx).map(|i| i.id.as_str())
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether there are no instances.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Collects instances and handlers, then validates them as a whole.
#[derive(Default)]
pub struct RegistryBuilder {
    instances: Vec<(String, Vec<String>, [Vec<Arc<HandlerEntry>>; 3])>,
    uplink: Option<String>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    /// Start from an existing registry. Handler state carries over.
    pub fn from_registry(registry: &InstanceRegistry) -> Self {
        let instances = registry
            .instances
            .iter()
            .map(|i| {
                let patterns = i.patterns.iter().map(ToString::to_string).collect();
                let mut chains = i.chains.clone();
                for chain in &mut chains {
                    chain.retain(|e| e.is_live());
                }
                (i.id.clone(), patterns, chains)
            })
            .collect();
        Self {
            instances,
            uplink: registry.uplink().map(|i| i.id.clone()),
            errors: Vec::new(),
        }
    }

    /// Declare an instance, or add patterns to one already declared.
    pub fn instance<I, S>(&mut self, id: &str, patterns: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns.into_iter().map(|p| p.as_ref().to_string());
        match self.instances.iter_mut().find(|(existing, _, _)| existing == id) {
            Some((_, existing, _)) => existing.extend(patterns),
            None => self
                .instances
                .push((id.to_string(), patterns.collect(), Default::default())),
        }
        self
    }

    /// Route domains that match no pattern to instance `id`. The uplink may
    /// be declared without patterns of its own.
    pub fn uplink(&mut self, id: &str) -> &mut Self {
        self.uplink = Some(id.to_string());
        self
    }

    /// Append a handler to `phase` of an instance declared earlier.
    pub fn handler<H>(&mut self, instance: &str, phase: Phase, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        self.shared_handler(instance, phase, Arc::new(handler))
    }

    /// [`handler`](Self::handler) for a handler shared with other instances.
    pub fn shared_handler(
        &mut self,
        instance: &str,
        phase: Phase,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        match self.instances.iter_mut().find(|(id, _, _)| id == instance) {
            Some((_, _, chains)) => chains[phase.index()].push(HandlerEntry::new(handler)),
            None => self.errors.push(format!(
                "handler '{}' registered for unknown instance '{}'",
                handler.name(),
                instance
            )),
        }
        self
    }

    /// Validate and produce the registry.
    pub fn build(self) -> Result<InstanceRegistry, XmppError> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(XmppError::config(first));
        }

        let mut registry = InstanceRegistry::default();
        for (idx, (id, raw_patterns, chains)) in self.instances.into_iter().enumerate() {
            if id.trim().is_empty() {
                return Err(XmppError::config("instance id must not be empty"));
            }
            let is_uplink = self.uplink.as_deref() == Some(id.as_str());
            if is_uplink {
                registry.uplink = Some(idx);
            }
            if raw_patterns.is_empty() && !is_uplink {
                return Err(XmppError::config(format!(
                    "instance '{}' has no domain patterns",
                    id
                )));
            }

            let mut patterns = Vec::with_capacity(raw_patterns.len());
            for raw in &raw_patterns {
                let pattern = DomainPattern::parse(raw)?;
                match &pattern {
                    DomainPattern::Exact(host) => {
                        if let Some(&other) = registry.exact.get(host) {
                            return Err(XmppError::config(format!(
                                "host '{}' claimed by both '{}' and '{}'",
                                host,
                                registry.instance_id(other).unwrap_or(id.as_str()),
                                id
                            )));
                        }
                        registry.exact.insert(host.clone(), idx);
                    }
                    wildcard => {
                        if let Some((_, other)) =
                            registry.wildcards.iter().find(|(p, _)| p == wildcard)
                        {
                            return Err(XmppError::config(format!(
                                "pattern '{}' claimed by both '{}' and '{}'",
                                wildcard,
                                registry.instance_id(*other).unwrap_or(id.as_str()),
                                id
                            )));
                        }
                        registry.wildcards.push((wildcard.clone(), idx));
                    }
                }
                patterns.push(pattern);
            }

            registry.instances.push(Instance {
                id,
                patterns,
                chains,
            });
        }

        if let (Some(id), None) = (&self.uplink, registry.uplink) {
            return Err(XmppError::config(format!(
                "uplink '{}' is not a declared instance",
                id
            )));
        }
        Ok(registry)
    }
}

/// Routing settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Domain used when a stanza carries no `to`
    pub default_domain: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_domain: "localhost".to_string(),
        }
    }
}

/// How dispatch ended for one stanza.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A handler consumed the stanza.
    Delivered {
        /// Instance that handled it
        instance: String,
    },
    /// The stanza was refused and an error reply was produced.
    Bounced {
        /// Instance that refused it, if one matched
        instance: Option<String>,
        /// Error condition carried by the bounce
        condition: StanzaErrorCondition,
        /// The error reply, addressed to the original sender
        bounce: Stanza,
    },
    /// The stanza was discarded without a reply.
    Dropped {
        /// Instance that matched, if any
        instance: Option<String>,
        /// Why
        reason: String,
    },
}

impl DispatchOutcome {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered { .. } => "delivered",
            DispatchOutcome::Bounced { .. } => "bounced",
            DispatchOutcome::Dropped { .. } => "dropped",
        }
    }
}

/// Result of [`Router::deliver`].
#[derive(Debug)]
pub struct Delivery {
    /// What happened to the stanza itself
    pub outcome: DispatchOutcome,
    /// A bounce no instance would take back. The caller writes it to the
    /// connection the stanza came from.
    pub returned: Option<Stanza>,
}

/// How a chain run ended.
enum ChainEnd {
    Consumed,
    Passed,
    Failed(StanzaErrorCondition, HandlerResult),
}

/// Routes stanzas through the active instance registry.
pub struct Router {
    config: RouterConfig,
    registry: RwLock<Arc<InstanceRegistry>>,
}

impl Router {
    /// Router over `registry`.
    pub fn new(config: RouterConfig, registry: InstanceRegistry) -> Self {
        info!(
            default_domain = %config.default_domain,
            instances = registry.len(),
            "Creating stanza router"
        );
        Self {
            config,
            registry: RwLock::new(Arc::new(registry)),
        }
    }

    /// Routing settings.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The registry dispatch currently uses.
    pub fn snapshot(&self) -> Arc<InstanceRegistry> {
        let guard = self.registry.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the registry. Dispatches already running keep the old one.
    pub fn publish(&self, registry: InstanceRegistry) {
        let mut guard = self.registry.write().unwrap_or_else(|e| e.into_inner());
        info!(instances = registry.len(), "Publishing routing registry");
        *guard = Arc::new(registry);
    }

    /// Copy the active registry, apply `edit`, validate and publish.
    fn update<F>(&self, edit: F) -> Result<(), XmppError>
    where
        F: FnOnce(&mut RegistryBuilder),
    {
        let mut guard = self.registry.write().unwrap_or_else(|e| e.into_inner());
        let mut builder = RegistryBuilder::from_registry(&guard);
        edit(&mut builder);
        *guard = Arc::new(builder.build()?);
        Ok(())
    }

    /// Add a domain pattern to an instance, creating it if needed.
    pub fn register_instance(&self, id: &str, pattern: &str) -> Result<(), XmppError> {
        self.update(|b| {
            b.instance(id, [pattern]);
        })?;
        debug!(instance = %id, pattern = %pattern, "Registered instance pattern");
        Ok(())
    }

    /// Append a handler to one phase of an instance.
    pub fn register_handler<H>(&self, instance: &str, phase: Phase, handler: H) -> Result<(), XmppError>
    where
        H: Handler + 'static,
    {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let name = handler.name().to_string();
        self.update(|b| {
            b.shared_handler(instance, phase, handler);
        })?;
        debug!(instance = %instance, phase = %phase, handler = %name, "Registered handler");
        Ok(())
    }

    /// Route one stanza and return what happened to it.
    pub fn dispatch(&self, stanza: Stanza) -> DispatchOutcome {
        self.dispatch_from(stanza, None)
    }

    /// Route a stanza injected by `source` (another instance), or off a
    /// socket when `source` is `None`.
    #[instrument(
        name = "xmpp.route.dispatch",
        skip_all,
        fields(kind = %stanza.kind(), to = ?stanza.to_domain(), source = ?source)
    )]
    pub fn dispatch_from(&self, stanza: Stanza, source: Option<&str>) -> DispatchOutcome {
        let kind = stanza.kind();
        let outcome = self.route(stanza, source);
        metrics::record_dispatch(kind, &outcome);
        outcome
    }

    fn route(&self, stanza: Stanza, source: Option<&str>) -> DispatchOutcome {
        if stanza.has_malformed_to() {
            return fail(None, stanza, StanzaErrorCondition::JidMalformed, "malformed destination address");
        }

        let registry = self.snapshot();
        let domain = stanza
            .to_domain()
            .unwrap_or(self.config.default_domain.as_str())
            .to_string();

        let Some(instance) = registry.resolve(&domain) else {
            return fail(
                None,
                stanza,
                StanzaErrorCondition::RemoteServerNotFound,
                &format!("no route to domain '{}'", domain),
            );
        };

        let mut packet = Packet::new(stanza, instance.id.clone(), source);

        for phase in Phase::ALL {
            match run_chain(instance, phase, &mut packet) {
                ChainEnd::Consumed => {
                    debug!(instance = %instance.id, phase = %phase, "Stanza consumed");
                    return DispatchOutcome::Delivered {
                        instance: instance.id.clone(),
                    };
                }
                ChainEnd::Passed => {}
                ChainEnd::Failed(condition, result) => {
                    let reason = format!("{} handler returned {:?}", phase, result);
                    return fail(Some(instance.id.clone()), packet.stanza, condition, &reason);
                }
            }
        }

        warn!(instance = %instance.id, "No delivery handler claimed stanza, dropping");
        DispatchOutcome::Dropped {
            instance: Some(instance.id.clone()),
            reason: "no delivery handler claimed the stanza".to_string(),
        }
    }

    /// Dispatch, then route any bounce back toward the original sender
    /// once.
    ///
    /// A bounce that has no return address, or that routing does not
    /// deliver, comes back in [`Delivery::returned`] so the caller can
    /// answer on the originating stream.
    pub fn deliver(&self, stanza: Stanza, source: Option<&str>) -> Delivery {
        let outcome = self.dispatch_from(stanza, source);

        let returned = match &outcome {
            DispatchOutcome::Bounced {
                instance, bounce, ..
            } => {
                if bounce.to().is_none() {
                    debug!("Bounce has no return address, returning to origin");
                    Some(bounce.clone())
                } else {
                    match self.dispatch_from(bounce.clone(), instance.as_deref()) {
                        DispatchOutcome::Delivered { .. } => {
                            debug!("Bounce routed");
                            None
                        }
                        other => {
                            debug!(outcome = other.label(), "Bounce not routable, returning to origin");
                            Some(bounce.clone())
                        }
                    }
                }
            }
            _ => None,
        };

        Delivery { outcome, returned }
    }
}

fn run_chain(instance: &Instance, phase: Phase, packet: &mut Packet) -> ChainEnd {
    for entry in &instance.chains[phase.index()] {
        if !entry.is_live() {
            continue;
        }
        let result = entry.handler.handle(packet);
        match result {
            HandlerResult::Pass => {}
            HandlerResult::Unregister => {
                entry.retired.store(true, Ordering::Release);
                debug!(
                    instance = %instance.id,
                    phase = %phase,
                    handler = %entry.handler.name(),
                    "Handler unregistered itself"
                );
            }
            HandlerResult::Done => return ChainEnd::Consumed,
            HandlerResult::Last => {
                let condition = match phase {
                    Phase::Conditional => StanzaErrorCondition::NotAllowed,
                    Phase::PreDelivery | Phase::Delivery => StanzaErrorCondition::ServiceUnavailable,
                };
                return ChainEnd::Failed(condition, result);
            }
            HandlerResult::Error => {
                return ChainEnd::Failed(StanzaErrorCondition::InternalServerError, result)
            }
        }
    }
    ChainEnd::Passed
}

/// Bounce `stanza`, or drop it when it is already an error.
fn fail(
    instance: Option<String>,
    stanza: Stanza,
    condition: StanzaErrorCondition,
    reason: &str,
) -> DispatchOutcome {
    match stanza.bounce(condition, Some(reason)) {
        Some(bounce) => {
            info!(
                instance = ?instance,
                condition = %condition,
                reason = %reason,
                "Bouncing stanza"
            );
            DispatchOutcome::Bounced {
                instance,
                condition,
                bounce,
            }
        }
        None => {
            warn!(
                instance = ?instance,
                reason = %reason,
                "Dropping undeliverable error stanza"
            );
            DispatchOutcome::Dropped {
                instance,
                reason: format!("error stanza not bounced: {}", reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ns;
    use minidom::Element;
    use std::sync::atomic::AtomicUsize;

    fn message(to: Option<&str>, from: &str) -> Stanza {
        let mut builder = Element::builder("message", ns::JABBER_SERVER).attr("from", from);
        if let Some(to) = to {
            builder = builder.attr("to", to);
        }
        let mut el = builder.build();
        el.append_text_node("hi");
        Stanza::new(el)
    }

    fn claim_all(_: &mut Packet) -> HandlerResult {
        HandlerResult::Done
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&mut Packet) -> HandlerResult + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &mut Packet| {
            c.fetch_add(1, Ordering::SeqCst);
            HandlerResult::Done
        })
    }

    fn router(build: impl FnOnce(&mut RegistryBuilder)) -> Router {
        let mut builder = InstanceRegistry::builder();
        build(&mut builder);
        Router::new(
            RouterConfig {
                default_domain: "home.example".into(),
            },
            builder.build().expect("valid registry"),
        )
    }

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(DomainPattern::parse("*").unwrap(), DomainPattern::Any);
        assert_eq!(
            DomainPattern::parse("*.Example.COM").unwrap(),
            DomainPattern::Subdomains("example.com".into())
        );
        assert_eq!(
            DomainPattern::parse("chat.example.com").unwrap(),
            DomainPattern::Exact("chat.example.com".into())
        );
        for bad in ["", "*.", "a*b", "user@host", ".x", "*.*.x"] {
            assert!(DomainPattern::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_subdomain_pattern_excludes_suffix() {
        let p = DomainPattern::Subdomains("example.com".into());
        assert!(p.matches("chat.example.com"));
        assert!(p.matches("a.b.example.com"));
        assert!(!p.matches("example.com"));
        assert!(!p.matches("badexample.com"));
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let r = router(|b| {
            b.instance("wild", ["*.example.com"])
                .handler("wild", Phase::Delivery, claim_all)
                .instance("exact", ["chat.example.com"])
                .handler("exact", Phase::Delivery, claim_all)
                .instance("any", ["*"])
                .handler("any", Phase::Delivery, claim_all);
        });

        let cases = [
            ("a@chat.example.com", "exact"),
            ("a@CHAT.example.com", "exact"),
            ("a@other.example.com", "wild"),
            ("a@example.com", "any"),
            ("a@elsewhere.org", "any"),
        ];
        for (to, expected) in cases {
            assert_eq!(
                r.dispatch(message(Some(to), "b@y")),
                DispatchOutcome::Delivered {
                    instance: expected.into()
                },
                "routing {to}"
            );
        }
    }

    #[test]
    fn test_first_wildcard_wins() {
        let r = router(|b| {
            b.instance("first", ["*.example.com"])
                .handler("first", Phase::Delivery, claim_all)
                .instance("second", ["*.chat.example.com"])
                .handler("second", Phase::Delivery, claim_all);
        });
        assert_eq!(
            r.dispatch(message(Some("a@muc.chat.example.com"), "b@y")),
            DispatchOutcome::Delivered {
                instance: "first".into()
            }
        );
    }

    #[test]
    fn test_unmatched_domain_bounces() {
        let r = router(|b| {
            b.instance("x", ["x"]).handler("x", Phase::Delivery, claim_all);
        });

        match r.dispatch(message(Some("a@nowhere"), "b@y")) {
            DispatchOutcome::Bounced {
                instance,
                condition,
                bounce,
            } => {
                assert_eq!(instance, None);
                assert_eq!(condition, StanzaErrorCondition::RemoteServerNotFound);
                assert_eq!(bounce.to_domain(), Some("y"));
                assert!(bounce.is_error());
            }
            other => panic!("expected bounce, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_to_uses_default_domain() {
        let r = router(|b| {
            b.instance("home", ["home.example"])
                .handler("home", Phase::Delivery, claim_all);
        });
        assert_eq!(
            r.dispatch(message(None, "b@y")),
            DispatchOutcome::Delivered {
                instance: "home".into()
            }
        );
    }

    #[test]
    fn test_malformed_to_bounces() {
        let r = router(|b| {
            b.instance("any", ["*"]).handler("any", Phase::Delivery, claim_all);
        });
        match r.dispatch(message(Some("@@"), "b@y")) {
            DispatchOutcome::Bounced { condition, .. } => {
                assert_eq!(condition, StanzaErrorCondition::JidMalformed)
            }
            other => panic!("expected bounce, got {other:?}"),
        }
    }

    #[test]
    fn test_filter_reject_short_circuits_delivery() {
        let (delivered, deliver) = counter();
        let (bounces, bounce_sink) = counter();
        let r = router(|b| {
            b.instance("x", ["x"])
                .handler("x", Phase::Conditional, |_: &mut Packet| HandlerResult::Last)
                .handler("x", Phase::Delivery, deliver)
                .instance("y", ["y"])
                .handler("y", Phase::Delivery, bounce_sink);
        });

        let delivery = r.deliver(message(Some("a@x"), "b@y"), None);

        assert!(matches!(
            delivery.outcome,
            DispatchOutcome::Bounced {
                condition: StanzaErrorCondition::NotAllowed,
                ..
            }
        ));
        assert!(delivery.returned.is_none());
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(bounces.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bounce_without_sender_is_returned() {
        let r = router(|b| {
            b.instance("home", ["home.example"])
                .handler("home", Phase::Delivery, claim_all);
        });
        let stanza = Stanza::new(
            Element::builder("message", ns::JABBER_SERVER)
                .attr("to", "carol@nowhere.example")
                .build(),
        );

        let delivery = r.deliver(stanza, None);

        assert_eq!(delivery.outcome.label(), "bounced");
        let returned = delivery.returned.expect("bounce handed back");
        assert!(returned.is_error());
        assert!(returned.to().is_none());
        assert_eq!(returned.element().attr("from"), Some("carol@nowhere.example"));
    }

    #[test]
    fn test_bounce_to_foreign_sender_is_returned() {
        let r = router(|b| {
            b.instance("home", ["home.example"])
                .handler("home", Phase::Delivery, claim_all);
        });

        let delivery = r.deliver(message(Some("carol@nowhere.example"), "peer@remote.example/r"), None);

        let returned = delivery.returned.expect("bounce handed back");
        assert_eq!(returned.to_domain(), Some("remote.example"));
        assert!(returned
            .element()
            .get_child("error", ns::JABBER_SERVER)
            .is_some_and(|e| e.has_child("remote-server-not-found", ns::STANZAS)));
    }

    #[test]
    fn test_uplink_takes_unmatched_domains() {
        let r = router(|b| {
            b.instance("home", ["home.example"])
                .handler("home", Phase::Delivery, claim_all)
                .instance("upstream", Vec::<String>::new())
                .handler("upstream", Phase::Delivery, claim_all)
                .uplink("upstream");
        });

        assert_eq!(
            r.dispatch(message(Some("a@home.example"), "b@y")),
            DispatchOutcome::Delivered {
                instance: "home".into()
            }
        );
        assert_eq!(
            r.dispatch(message(Some("a@elsewhere.org"), "b@y")),
            DispatchOutcome::Delivered {
                instance: "upstream".into()
            }
        );
        assert_eq!(r.snapshot().uplink().map(Instance::id), Some("upstream"));
    }

    #[test]
    fn test_uplink_survives_registration() {
        let r = router(|b| {
            b.instance("upstream", ["up.example"]).uplink("upstream");
        });
        r.register_instance("other", "other.example").unwrap();
        assert_eq!(r.snapshot().resolve("unknown.org").map(Instance::id), Some("upstream"));
    }

    #[test]
    fn test_uplink_must_be_declared() {
        let mut builder = InstanceRegistry::builder();
        builder.instance("a", ["a"]).uplink("missing");
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_pre_delivery_rewrite_is_seen_by_delivery() {
        let seen = Arc::new(RwLock::new(String::new()));
        let seen_in = Arc::clone(&seen);
        let r = router(|b| {
            b.instance("x", ["x"])
                .handler("x", Phase::PreDelivery, |p: &mut Packet| {
                    p.stanza.set_type(Some("chat"));
                    HandlerResult::Pass
                })
                .handler("x", Phase::Delivery, move |p: &mut Packet| {
                    *seen_in.write().unwrap() = format!("{:?}", p.stanza.subtype());
                    HandlerResult::Done
                });
        });

        r.dispatch(message(Some("a@x"), "b@y"));
        assert_eq!(seen.read().unwrap().as_str(), "Chat");
    }

    #[test]
    fn test_delivery_chain_order_and_pass() {
        let order = Arc::new(RwLock::new(Vec::new()));
        let (o1, o2) = (Arc::clone(&order), Arc::clone(&order));
        let r = router(|b| {
            b.instance("x", ["x"])
                .handler("x", Phase::Delivery, move |_: &mut Packet| {
                    o1.write().unwrap().push("first");
                    HandlerResult::Pass
                })
                .handler("x", Phase::Delivery, move |_: &mut Packet| {
                    o2.write().unwrap().push("second");
                    HandlerResult::Done
                })
                .handler("x", Phase::Delivery, |_: &mut Packet| -> HandlerResult {
                    panic!("must not run after Done")
                });
        });

        assert!(matches!(
            r.dispatch(message(Some("a@x"), "b@y")),
            DispatchOutcome::Delivered { .. }
        ));
        assert_eq!(*order.read().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_unclaimed_stanza_is_dropped() {
        let r = router(|b| {
            b.instance("x", ["x"])
                .handler("x", Phase::Delivery, |_: &mut Packet| HandlerResult::Pass);
        });
        assert!(matches!(
            r.dispatch(message(Some("a@x"), "b@y")),
            DispatchOutcome::Dropped { instance: Some(_), .. }
        ));
    }

    #[test]
    fn test_handler_error_bounces_internal_error() {
        let r = router(|b| {
            b.instance("x", ["x"])
                .handler("x", Phase::Delivery, |_: &mut Packet| HandlerResult::Error);
        });
        assert!(matches!(
            r.dispatch(message(Some("a@x"), "b@y")),
            DispatchOutcome::Bounced {
                condition: StanzaErrorCondition::InternalServerError,
                ..
            }
        ));
    }

    #[test]
    fn test_error_stanza_is_dropped_not_bounced() {
        let r = router(|_| {});
        let mut stanza = message(Some("a@nowhere"), "b@y");
        stanza.set_type(Some("error"));
        assert!(matches!(r.dispatch(stanza), DispatchOutcome::Dropped { instance: None, .. }));
    }

    #[test]
    fn test_unregister_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = Arc::clone(&runs);
        let r = router(|b| {
            b.instance("x", ["x"])
                .handler("x", Phase::PreDelivery, move |_: &mut Packet| {
                    runs_in.fetch_add(1, Ordering::SeqCst);
                    HandlerResult::Unregister
                })
                .handler("x", Phase::Delivery, claim_all);
        });

        for _ in 0..3 {
            assert!(matches!(
                r.dispatch(message(Some("a@x"), "b@y")),
                DispatchOutcome::Delivered { .. }
            ));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            r.snapshot().instance("x").unwrap().handler_count(Phase::PreDelivery),
            0
        );
    }

    #[test]
    fn test_registration_is_copy_on_write() {
        let r = router(|b| {
            b.instance("x", ["x"]);
        });
        let before = r.snapshot();

        r.register_instance("x", "x2").unwrap();
        r.register_handler("x", Phase::Delivery, claim_all).unwrap();

        assert_eq!(before.instance("x").unwrap().handler_count(Phase::Delivery), 0);
        assert!(before.resolve("x2").is_none());

        let after = r.snapshot();
        assert_eq!(after.instance("x").unwrap().handler_count(Phase::Delivery), 1);
        assert_eq!(after.resolve("x2").map(Instance::id), Some("x"));
    }

    #[test]
    fn test_failed_registration_leaves_registry_untouched() {
        let r = router(|b| {
            b.instance("x", ["x"]).instance("y", ["y"]);
        });

        assert!(r.register_instance("y", "x").is_err());
        assert!(r.register_handler("missing", Phase::Delivery, claim_all).is_err());
        assert_eq!(r.snapshot().resolve("x").map(Instance::id), Some("x"));
    }

    #[test]
    fn test_build_validation() {
        let mut dup = InstanceRegistry::builder();
        dup.instance("a", ["host"]).instance("b", ["HOST"]);
        assert!(dup.build().is_err());

        let mut dup_wild = InstanceRegistry::builder();
        dup_wild.instance("a", ["*.h"]).instance("b", ["*.h"]);
        assert!(dup_wild.build().is_err());

        let mut empty = InstanceRegistry::builder();
        empty.instance("a", Vec::<String>::new());
        assert!(empty.build().is_err());

        let mut orphan = InstanceRegistry::builder();
        orphan.handler("ghost", Phase::Delivery, claim_all);
        assert!(orphan.build().is_err());
    }

    #[test]
    fn test_publish_swaps_atomically() {
        let r = router(|b| {
            b.instance("old", ["x"]).handler("old", Phase::Delivery, claim_all);
        });
        let held = r.snapshot();

        let mut next = InstanceRegistry::builder();
        next.instance("new", ["x"]).handler("new", Phase::Delivery, claim_all);
        r.publish(next.build().unwrap());

        assert_eq!(held.resolve("x").map(Instance::id), Some("old"));
        assert_eq!(
            r.dispatch(message(Some("a@x"), "b@y")),
            DispatchOutcome::Delivered {
                instance: "new".into()
            }
        );
    }
}
