//! Order and authorization state machine
//!
//! Each order is stored together with its authorizations and challenges
//! as one aggregate behind its own mutex, so a challenge result and the
//! order re-evaluation it triggers are applied by a single writer.
//!
//! Transitions:
//!
//! ```text
//! challenge      pending -> valid | invalid              (terminal)
//! authorization  pending -> valid   (any challenge valid, never regresses)
//!                pending -> invalid (every challenge invalid, or expired)
//! order          pending -> ready   (every authorization valid)
//!                pending -> invalid (any authorization invalid, or expired)
//!                ready -> processing -> valid            (finalization)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use certmill_common::{AuthorizationId, ChallengeId, OrderId};
use certmill_config::OrderConfig;

use super::model::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, ChallengeType, Identifier,
    Order, OrderStatus,
};
use crate::clock::Clock;
use crate::crypto;
use crate::error::{EngineError, EngineResult};

/// Lifetimes applied to new orders and authorizations
#[derive(Debug, Clone, Copy)]
pub struct OrderSettings {
    pub order_ttl: Duration,
    pub authorization_ttl: Duration,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            order_ttl: Duration::days(7),
            authorization_ttl: Duration::days(1),
        }
    }
}

impl TryFrom<&OrderConfig> for OrderSettings {
    type Error = EngineError;

    fn try_from(config: &OrderConfig) -> EngineResult<Self> {
        let hours = |name: &str, h: u64| {
            i64::try_from(h)
                .ok()
                .and_then(Duration::try_hours)
                .ok_or_else(|| EngineError::Configuration(format!("{} of {} hours is out of range", name, h)))
        };
        Ok(Self {
            order_ttl: hours("order ttl", config.order_ttl_hours)?,
            authorization_ttl: hours("authorization ttl", config.authorization_ttl_hours)?,
        })
    }
}

/// One order with everything it owns
#[derive(Debug)]
struct OrderAggregate {
    order: Order,
    authorizations: Vec<Authorization>,
    challenges: Vec<Challenge>,
}

impl OrderAggregate {
    /// Settle an authorization from its challenges. Never leaves a
    /// non-pending status.
    fn settle_authorization(&mut self, authz_id: &AuthorizationId) {
        let statuses: Vec<ChallengeStatus> = self
            .challenges
            .iter()
            .filter(|c| &c.authorization_id == authz_id)
            .map(|c| c.status)
            .collect();

        let Some(authz) = self.authorizations.iter_mut().find(|a| &a.id == authz_id) else {
            return;
        };
        if authz.status != AuthorizationStatus::Pending {
            trace!(authorization_id = %authz.id, status = ?authz.status, "Authorization already settled");
            return;
        }

        if statuses.contains(&ChallengeStatus::Valid) {
            authz.status = AuthorizationStatus::Valid;
            info!(authorization_id = %authz.id, identifier = %authz.identifier, "Authorization valid");
        } else if !statuses.is_empty() && statuses.iter().all(|s| *s == ChallengeStatus::Invalid) {
            authz.status = AuthorizationStatus::Invalid;
            warn!(authorization_id = %authz.id, identifier = %authz.identifier, "Authorization invalid");
        }
    }

    /// Recompute the order status from the full set of authorizations
    fn reevaluate_order(&mut self) {
        if self.order.status != OrderStatus::Pending {
            return;
        }

        if let Some(failed) = self
            .authorizations
            .iter()
            .find(|a| a.status == AuthorizationStatus::Invalid)
        {
            self.order.status = OrderStatus::Invalid;
            self.order.error = Some(format!("authorization for {} failed", failed.identifier.value));
            warn!(order_id = %self.order.id, identifier = %failed.identifier, "Order invalid");
        } else if self
            .authorizations
            .iter()
            .all(|a| a.status == AuthorizationStatus::Valid)
        {
            self.order.status = OrderStatus::Ready;
            info!(order_id = %self.order.id, "Order ready for finalization");
        }
    }

    /// Invalidate anything pending whose deadline has passed
    fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        let expired: Vec<AuthorizationId> = self
            .authorizations
            .iter_mut()
            .filter(|a| a.status == AuthorizationStatus::Pending && a.expires_at <= now)
            .map(|a| {
                a.status = AuthorizationStatus::Invalid;
                a.id.clone()
            })
            .collect();

        for challenge in &mut self.challenges {
            if challenge.status == ChallengeStatus::Pending && expired.contains(&challenge.authorization_id) {
                challenge.status = ChallengeStatus::Invalid;
                challenge.error = Some("authorization expired".to_string());
            }
        }
        changed |= !expired.is_empty();

        if matches!(self.order.status, OrderStatus::Pending | OrderStatus::Ready)
            && self.order.expires_at <= now
        {
            self.order.status = OrderStatus::Invalid;
            self.order.error = Some("order expired".to_string());
            changed = true;
        }

        self.reevaluate_order();
        changed
    }
}

/// Owner of every order, authorization and challenge in the engine
#[derive(Debug)]
pub struct OrderStateMachine {
    orders: DashMap<OrderId, Arc<Mutex<OrderAggregate>>>,
    authorization_index: DashMap<AuthorizationId, OrderId>,
    challenge_index: DashMap<ChallengeId, OrderId>,
    settings: OrderSettings,
    /// Account key thumbprint challenges are bound to
    thumbprint: String,
    clock: Arc<dyn Clock>,
}

impl OrderStateMachine {
    pub fn new(settings: OrderSettings, thumbprint: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            orders: DashMap::new(),
            authorization_index: DashMap::new(),
            challenge_index: DashMap::new(),
            settings,
            thumbprint: thumbprint.into(),
            clock,
        }
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Create an order with one authorization and two challenges per
    /// identifier, everything `pending`.
    ///
    /// Either the whole order is created or nothing is.
    pub fn create_order(&self, identifiers: Vec<Identifier>, profile: Option<String>) -> EngineResult<Order> {
        if identifiers.is_empty() {
            return Err(EngineError::Validation(
                "an order needs at least one identifier".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            let identifier = identifier.normalized()?;
            if !seen.insert(identifier.value.clone()) {
                return Err(EngineError::Validation(format!(
                    "duplicate identifier '{}'",
                    identifier.value
                )));
            }
            normalized.push(identifier);
        }

        let now = self.clock.now();
        let order_id = OrderId::generate();
        let mut authorizations = Vec::with_capacity(normalized.len());
        let mut challenges = Vec::with_capacity(normalized.len() * 2);

        for identifier in &normalized {
            let authz_id = AuthorizationId::generate();
            let mut challenge_ids = Vec::with_capacity(2);

            for kind in ChallengeType::ALL {
                let token = crypto::generate_token();
                let key_authorization = crypto::key_authorization(&token, &self.thumbprint);
                let challenge = Challenge {
                    id: ChallengeId::generate(),
                    authorization_id: authz_id.clone(),
                    kind,
                    token,
                    key_authorization,
                    status: ChallengeStatus::Pending,
                    validated_at: None,
                    error: None,
                };
                challenge_ids.push(challenge.id.clone());
                challenges.push(challenge);
            }

            authorizations.push(Authorization {
                id: authz_id,
                order_id: order_id.clone(),
                identifier: identifier.clone(),
                status: AuthorizationStatus::Pending,
                expires_at: now + self.settings.authorization_ttl,
                challenge_ids,
            });
        }

        let order = Order {
            id: order_id.clone(),
            identifiers: normalized,
            profile,
            status: OrderStatus::Pending,
            expires_at: now + self.settings.order_ttl,
            created_at: now,
            certificate_url: None,
            authorization_ids: authorizations.iter().map(|a| a.id.clone()).collect(),
            csr_pem: None,
            certificate_pem: None,
            certificate_expires_at: None,
            error: None,
        };

        for authz in &authorizations {
            self.authorization_index.insert(authz.id.clone(), order_id.clone());
        }
        for challenge in &challenges {
            self.challenge_index.insert(challenge.id.clone(), order_id.clone());
        }
        self.orders.insert(
            order_id.clone(),
            Arc::new(Mutex::new(OrderAggregate {
                order: order.clone(),
                authorizations,
                challenges,
            })),
        );

        info!(
            order_id = %order_id,
            identifiers = ?order.domains(),
            expires_at = %order.expires_at,
            "Created order"
        );
        Ok(order)
    }

    /// Apply a definitive validation result to a challenge
    pub fn record_challenge_result(&self, challenge_id: &ChallengeId, valid: bool) -> EngineResult<Order> {
        self.record_challenge_outcome(challenge_id, valid, None)
    }

    /// Like [`record_challenge_result`](Self::record_challenge_result), keeping
    /// the validator's diagnostic on the challenge.
    ///
    /// A result for a challenge that is already terminal is ignored, so
    /// duplicate deliveries are harmless.
    pub fn record_challenge_outcome(
        &self,
        challenge_id: &ChallengeId,
        valid: bool,
        detail: Option<String>,
    ) -> EngineResult<Order> {
        let aggregate = self.aggregate_for_challenge(challenge_id)?;
        let mut guard = aggregate.lock();
        let agg = &mut *guard;
        let now = self.clock.now();

        let challenge = agg
            .challenges
            .iter_mut()
            .find(|c| &c.id == challenge_id)
            .ok_or_else(|| EngineError::not_found("challenge", challenge_id))?;

        if challenge.status.is_terminal() {
            debug!(
                challenge_id = %challenge_id,
                status = ?challenge.status,
                "Ignoring result for settled challenge"
            );
            return Ok(agg.order.clone());
        }

        if valid {
            challenge.status = ChallengeStatus::Valid;
            challenge.validated_at = Some(now);
            challenge.error = None;
        } else {
            challenge.status = ChallengeStatus::Invalid;
            challenge.error = detail;
        }
        let authz_id = challenge.authorization_id.clone();
        debug!(
            challenge_id = %challenge_id,
            challenge_type = %challenge.kind,
            valid,
            "Recorded challenge result"
        );

        agg.settle_authorization(&authz_id);
        agg.reevaluate_order();
        Ok(agg.order.clone())
    }

    /// Invalidate pending orders and authorizations past their deadline.
    ///
    /// Returns the number of orders that changed.
    pub fn expire_stale(&self) -> usize {
        let now = self.clock.now();
        let aggregates: Vec<_> = self.orders.iter().map(|e| Arc::clone(e.value())).collect();

        let mut changed = 0;
        for aggregate in aggregates {
            let mut agg = aggregate.lock();
            if agg.expire(now) {
                debug!(order_id = %agg.order.id, status = %agg.order.status, "Expired stale order state");
                changed += 1;
            }
        }
        if changed > 0 {
            info!(changed, "Expired stale orders");
        }
        changed
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Store the CSR an order will be finalized with
    pub fn attach_csr(&self, order_id: &OrderId, csr_pem: &str) -> EngineResult<()> {
        let aggregate = self.aggregate(order_id)?;
        let mut agg = aggregate.lock();
        if !matches!(agg.order.status, OrderStatus::Pending | OrderStatus::Ready) {
            return Err(EngineError::invalid_state(
                "order",
                order_id,
                format!("cannot attach a CSR to a {} order", agg.order.status),
            ));
        }
        agg.order.csr_pem = Some(csr_pem.to_string());
        Ok(())
    }

    /// `ready -> processing`
    pub fn mark_processing(&self, order_id: &OrderId) -> EngineResult<Order> {
        self.transition(order_id, OrderStatus::Ready, OrderStatus::Processing, |_| {})
    }

    /// `processing -> valid` with the issued chain
    pub fn mark_valid(
        &self,
        order_id: &OrderId,
        certificate_pem: String,
        certificate_expires_at: DateTime<Utc>,
    ) -> EngineResult<Order> {
        let url = format!("/certificates/{}", order_id);
        self.transition(order_id, OrderStatus::Processing, OrderStatus::Valid, |order| {
            order.certificate_pem = Some(certificate_pem);
            order.certificate_expires_at = Some(certificate_expires_at);
            order.certificate_url = Some(url);
        })
    }

    /// Fail an order that has not been issued
    pub fn mark_invalid(&self, order_id: &OrderId, error: impl Into<String>) -> EngineResult<Order> {
        let aggregate = self.aggregate(order_id)?;
        let mut agg = aggregate.lock();
        if agg.order.status == OrderStatus::Valid {
            return Err(EngineError::invalid_state(
                "order",
                order_id,
                "an issued order cannot be invalidated",
            ));
        }
        agg.order.status = OrderStatus::Invalid;
        agg.order.error = Some(error.into());
        warn!(order_id = %order_id, error = ?agg.order.error, "Order invalidated");
        Ok(agg.order.clone())
    }

    fn transition(
        &self,
        order_id: &OrderId,
        from: OrderStatus,
        to: OrderStatus,
        apply: impl FnOnce(&mut Order),
    ) -> EngineResult<Order> {
        let aggregate = self.aggregate(order_id)?;
        let mut agg = aggregate.lock();
        if agg.order.status != from {
            return Err(EngineError::invalid_state(
                "order",
                order_id,
                format!("expected {} but order is {}", from, agg.order.status),
            ));
        }
        agg.order.status = to;
        apply(&mut agg.order);
        info!(order_id = %order_id, from = %from, to = %to, "Order transition");
        Ok(agg.order.clone())
    }

    /// Drop an order and everything it owns (revoked or superseded)
    pub fn archive(&self, order_id: &OrderId) -> Option<Order> {
        let (_, aggregate) = self.orders.remove(order_id)?;
        let agg = aggregate.lock();
        for authz in &agg.authorizations {
            self.authorization_index.remove(&authz.id);
        }
        for challenge in &agg.challenges {
            self.challenge_index.remove(&challenge.id);
        }
        info!(order_id = %order_id, "Archived order");
        Some(agg.order.clone())
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn get_order(&self, order_id: &OrderId) -> Option<Order> {
        self.orders.get(order_id).map(|e| e.value().lock().order.clone())
    }

    pub fn get_authorization(&self, authz_id: &AuthorizationId) -> Option<Authorization> {
        let order_id = self.authorization_index.get(authz_id)?.value().clone();
        let aggregate = self.aggregate(&order_id).ok()?;
        let agg = aggregate.lock();
        agg.authorizations.iter().find(|a| &a.id == authz_id).cloned()
    }

    pub fn get_challenge(&self, challenge_id: &ChallengeId) -> Option<Challenge> {
        let aggregate = self.aggregate_for_challenge(challenge_id).ok()?;
        let agg = aggregate.lock();
        agg.challenges.iter().find(|c| &c.id == challenge_id).cloned()
    }

    /// Challenge together with the identifier it proves control of
    pub fn challenge_with_identifier(&self, challenge_id: &ChallengeId) -> EngineResult<(Challenge, Identifier)> {
        let aggregate = self.aggregate_for_challenge(challenge_id)?;
        let agg = aggregate.lock();
        let challenge = agg
            .challenges
            .iter()
            .find(|c| &c.id == challenge_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("challenge", challenge_id))?;
        let identifier = agg
            .authorizations
            .iter()
            .find(|a| a.id == challenge.authorization_id)
            .map(|a| a.identifier.clone())
            .ok_or_else(|| EngineError::not_found("authorization", &challenge.authorization_id))?;
        Ok((challenge, identifier))
    }

    pub fn authorizations(&self, order_id: &OrderId) -> EngineResult<Vec<Authorization>> {
        Ok(self.aggregate(order_id)?.lock().authorizations.clone())
    }

    pub fn challenges_for_order(&self, order_id: &OrderId) -> EngineResult<Vec<Challenge>> {
        Ok(self.aggregate(order_id)?.lock().challenges.clone())
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn aggregate(&self, order_id: &OrderId) -> EngineResult<Arc<Mutex<OrderAggregate>>> {
        self.orders
            .get(order_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::not_found("order", order_id))
    }

    fn aggregate_for_challenge(&self, challenge_id: &ChallengeId) -> EngineResult<Arc<Mutex<OrderAggregate>>> {
        let order_id = self
            .challenge_index
            .get(challenge_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found("challenge", challenge_id))?;
        self.aggregate(&order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn machine() -> (Arc<ManualClock>, OrderStateMachine) {
        let clock = Arc::new(ManualClock::starting_now());
        let sm = OrderStateMachine::new(OrderSettings::default(), "thumb", clock.clone());
        (clock, sm)
    }

    fn challenge_of(sm: &OrderStateMachine, order: &Order, index: usize, kind: ChallengeType) -> Challenge {
        let authz = sm.get_authorization(&order.authorization_ids[index]).unwrap();
        authz
            .challenge_ids
            .iter()
            .filter_map(|id| sm.get_challenge(id))
            .find(|c| c.kind == kind)
            .unwrap()
    }

    #[test]
    fn test_order_settings_reject_oversized_ttls() {
        let settings = OrderSettings::try_from(&OrderConfig::default()).unwrap();
        assert_eq!(settings.order_ttl, Duration::days(7));

        let config = OrderConfig {
            order_ttl_hours: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            OrderSettings::try_from(&config),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_create_order_shape() {
        let (clock, sm) = machine();
        let order = sm
            .create_order(vec![Identifier::dns("Example.com")], Some("tls-server".to_string()))
            .unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.identifiers[0].value, "example.com");
        assert_eq!(order.expires_at, clock.now() + Duration::days(7));
        assert_eq!(order.authorization_ids.len(), 1);

        let authz = sm.get_authorization(&order.authorization_ids[0]).unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Pending);
        assert_eq!(authz.expires_at, clock.now() + Duration::days(1));

        let challenges = sm.challenges_for_order(&order.id).unwrap();
        assert_eq!(challenges.len(), 2);
        let kinds: Vec<_> = challenges.iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&ChallengeType::Http01));
        assert!(kinds.contains(&ChallengeType::Dns01));
        for c in &challenges {
            assert_eq!(c.status, ChallengeStatus::Pending);
            assert_eq!(c.key_authorization, format!("{}.thumb", c.token));
        }
        assert_ne!(challenges[0].token, challenges[1].token);
    }

    #[test]
    fn test_create_order_is_atomic() {
        let (_, sm) = machine();
        let err = sm
            .create_order(
                vec![Identifier::dns("good.example.com"), Identifier::dns("bad domain")],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(sm.is_empty());

        assert!(sm.create_order(vec![], None).is_err());
        assert!(sm
            .create_order(
                vec![Identifier::dns("a.example.com"), Identifier::dns("A.example.com")],
                None
            )
            .is_err());
        assert!(sm.is_empty());
    }

    #[test]
    fn test_http01_success_readies_single_identifier_order() {
        let (_, sm) = machine();
        let order = sm.create_order(vec![Identifier::dns("example.com")], None).unwrap();
        let http = challenge_of(&sm, &order, 0, ChallengeType::Http01);

        let updated = sm.record_challenge_result(&http.id, true).unwrap();
        assert_eq!(updated.status, OrderStatus::Ready);

        let http = sm.get_challenge(&http.id).unwrap();
        assert_eq!(http.status, ChallengeStatus::Valid);
        assert!(http.validated_at.is_some());
        assert_eq!(
            sm.get_authorization(&order.authorization_ids[0]).unwrap().status,
            AuthorizationStatus::Valid
        );
    }

    #[test]
    fn test_failing_sibling_does_not_revert_valid_authorization() {
        let (_, sm) = machine();
        let order = sm.create_order(vec![Identifier::dns("example.com")], None).unwrap();
        let http = challenge_of(&sm, &order, 0, ChallengeType::Http01);
        let dns = challenge_of(&sm, &order, 0, ChallengeType::Dns01);

        sm.record_challenge_result(&dns.id, true).unwrap();
        let updated = sm
            .record_challenge_outcome(&http.id, false, Some("HTTP 404".to_string()))
            .unwrap();

        assert_eq!(updated.status, OrderStatus::Ready);
        assert_eq!(
            sm.get_authorization(&order.authorization_ids[0]).unwrap().status,
            AuthorizationStatus::Valid
        );
        assert_eq!(sm.get_challenge(&http.id).unwrap().error.as_deref(), Some("HTTP 404"));
    }

    #[test]
    fn test_one_invalid_challenge_keeps_authorization_pending() {
        let (_, sm) = machine();
        let order = sm.create_order(vec![Identifier::dns("example.com")], None).unwrap();
        let http = challenge_of(&sm, &order, 0, ChallengeType::Http01);
        let dns = challenge_of(&sm, &order, 0, ChallengeType::Dns01);

        let updated = sm.record_challenge_result(&http.id, false).unwrap();
        assert_eq!(updated.status, OrderStatus::Pending);

        let updated = sm.record_challenge_result(&dns.id, false).unwrap();
        assert_eq!(updated.status, OrderStatus::Invalid);
        assert_eq!(
            sm.get_authorization(&order.authorization_ids[0]).unwrap().status,
            AuthorizationStatus::Invalid
        );
        assert!(updated.error.unwrap().contains("example.com"));
    }

    #[test]
    fn test_order_ready_only_when_all_authorizations_valid() {
        let (_, sm) = machine();
        let names = ["a.example.com", "b.example.com", "c.example.com"];
        let order = sm
            .create_order(names.iter().map(|n| Identifier::dns(*n)).collect(), None)
            .unwrap();

        for index in 0..names.len() - 1 {
            let c = challenge_of(&sm, &order, index, ChallengeType::Dns01);
            let updated = sm.record_challenge_result(&c.id, true).unwrap();
            assert_eq!(updated.status, OrderStatus::Pending);
        }

        let last = challenge_of(&sm, &order, names.len() - 1, ChallengeType::Http01);
        let updated = sm.record_challenge_result(&last.id, true).unwrap();
        assert_eq!(updated.status, OrderStatus::Ready);
    }

    #[test]
    fn test_invalid_authorization_fails_order_fast() {
        let (_, sm) = machine();
        let order = sm
            .create_order(
                vec![Identifier::dns("a.example.com"), Identifier::dns("b.example.com")],
                None,
            )
            .unwrap();

        for kind in ChallengeType::ALL {
            let c = challenge_of(&sm, &order, 1, kind);
            sm.record_challenge_result(&c.id, false).unwrap();
        }
        assert_eq!(sm.get_order(&order.id).unwrap().status, OrderStatus::Invalid);

        // A late success on the other identifier does not resurrect the order
        let c = challenge_of(&sm, &order, 0, ChallengeType::Http01);
        let updated = sm.record_challenge_result(&c.id, true).unwrap();
        assert_eq!(updated.status, OrderStatus::Invalid);
    }

    #[test]
    fn test_duplicate_result_is_ignored() {
        let (_, sm) = machine();
        let order = sm.create_order(vec![Identifier::dns("example.com")], None).unwrap();
        let http = challenge_of(&sm, &order, 0, ChallengeType::Http01);

        sm.record_challenge_result(&http.id, true).unwrap();
        let validated_at = sm.get_challenge(&http.id).unwrap().validated_at;
        sm.record_challenge_result(&http.id, false).unwrap();

        let http = sm.get_challenge(&http.id).unwrap();
        assert_eq!(http.status, ChallengeStatus::Valid);
        assert_eq!(http.validated_at, validated_at);
    }

    #[test]
    fn test_unknown_challenge() {
        let (_, sm) = machine();
        let err = sm
            .record_challenge_result(&ChallengeId::new("chall_missing"), true)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "challenge", .. }));
    }

    #[test]
    fn test_expire_stale() {
        let (clock, sm) = machine();
        let order = sm.create_order(vec![Identifier::dns("example.com")], None).unwrap();

        assert_eq!(sm.expire_stale(), 0);
        clock.advance(Duration::hours(25));
        assert_eq!(sm.expire_stale(), 1);

        let order = sm.get_order(&order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
        for c in sm.challenges_for_order(&order.id).unwrap() {
            assert_eq!(c.status, ChallengeStatus::Invalid);
        }
    }

    #[test]
    fn test_finalization_flow() {
        let (clock, sm) = machine();
        let order = sm.create_order(vec![Identifier::dns("example.com")], None).unwrap();
        sm.attach_csr(&order.id, "CSR").unwrap();

        // Not ready yet
        assert!(sm.mark_processing(&order.id).is_err());

        let c = challenge_of(&sm, &order, 0, ChallengeType::Http01);
        sm.record_challenge_result(&c.id, true).unwrap();
        sm.mark_processing(&order.id).unwrap();

        let expires = clock.now() + Duration::days(90);
        let order = sm.mark_valid(&order.id, "CHAIN".to_string(), expires).unwrap();
        assert_eq!(order.status, OrderStatus::Valid);
        assert_eq!(order.certificate_pem.as_deref(), Some("CHAIN"));
        assert_eq!(order.csr_pem.as_deref(), Some("CSR"));
        assert!(order.certificate_url.is_some());

        assert!(sm.mark_invalid(&order.id, "too late").is_err());
    }

    #[test]
    fn test_archive_removes_everything() {
        let (_, sm) = machine();
        let order = sm.create_order(vec![Identifier::dns("example.com")], None).unwrap();
        let c = challenge_of(&sm, &order, 0, ChallengeType::Http01);

        assert!(sm.archive(&order.id).is_some());
        assert!(sm.get_order(&order.id).is_none());
        assert!(sm.get_challenge(&c.id).is_none());
        assert!(sm.get_authorization(&order.authorization_ids[0]).is_none());
        assert!(sm.archive(&order.id).is_none());
    }

    proptest! {
        /// Authorizations never leave `valid`, and become valid as soon as
        /// any challenge does, whatever order results arrive in.
        #[test]
        fn prop_authorization_monotonic_or_semantics(
            results in proptest::collection::vec((0usize..2, any::<bool>()), 1..8)
        ) {
            let (_, sm) = machine();
            let order = sm.create_order(vec![Identifier::dns("example.com")], None).unwrap();
            let authz_id = order.authorization_ids[0].clone();
            let challenge_ids = sm.get_authorization(&authz_id).unwrap().challenge_ids;

            let mut any_valid = false;
            let mut seen_valid = false;
            let mut settled = [None::<bool>; 2];

            for (index, valid) in results {
                sm.record_challenge_result(&challenge_ids[index], valid).unwrap();
                if settled[index].is_none() {
                    settled[index] = Some(valid);
                }
                any_valid |= settled[index] == Some(true);

                let status = sm.get_authorization(&authz_id).unwrap().status;
                if seen_valid {
                    prop_assert_eq!(status, AuthorizationStatus::Valid);
                }
                if any_valid {
                    prop_assert_eq!(status, AuthorizationStatus::Valid);
                    seen_valid = true;
                } else if settled.iter().all(|s| *s == Some(false)) {
                    prop_assert_eq!(status, AuthorizationStatus::Invalid);
                } else {
                    prop_assert_eq!(status, AuthorizationStatus::Pending);
                }

                let order_status = sm.get_order(&order.id).unwrap().status;
                prop_assert_eq!(order_status == OrderStatus::Ready, status == AuthorizationStatus::Valid);
            }
        }
    }
}
