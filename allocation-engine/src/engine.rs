//! Allocation race resolver
//!
//! The winner of a routing is decided by one conditional update:
//!
//! ```sql
//! UPDATE allocation_routings
//!    SET locked_winner = ?, locked_at = ?, version = version + 1, status = 'LOCKED'
//!  WHERE routing_id = ? AND locked_winner IS NULL AND status = 'BROADCAST'
//! ```
//!
//! The store executes the statement atomically, so of any number of
//! simultaneous acceptors exactly one affects a row. Everything else
//! (response bookkeeping, cancellation fan-out, notifications) happens
//! after that decision and never influences it.

use crate::notifier::{NoopNotifier, Notifier, OutboundNotice};
use crate::scoring::{rank_candidates, AllocationConfig};
use crate::types::{
    AcceptReason, AcceptanceResult, AllocationRouting, CancellationReason, CancellationRecord,
    CandidateResponse, EligibilityQuery, ResponseKind, RoutingStatus, TimeoutOutcome,
    WholesalerProfile,
};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::sync::Arc;
use store_core::error::is_unique_violation;
use store_core::types::{
    decimal_to_db, fmt_timestamp, parse_decimal, parse_timestamp, parse_uuid,
};
use store_core::{CoreError, OrderId, Result, RetailerId, TxExecutor, WholesalerId};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// row mapping

fn ids_to_json(ids: &[WholesalerId]) -> Result<String> {
    let raw: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    Ok(serde_json::to_string(&raw)?)
}

fn ids_from_json(raw: &str) -> Result<Vec<WholesalerId>> {
    let parsed: Vec<String> = serde_json::from_str(raw)?;
    parsed
        .iter()
        .map(|id| parse_uuid(id).map(WholesalerId::new))
        .collect()
}

fn routing_from_row(row: &SqliteRow) -> Result<AllocationRouting> {
    let routing_id: String = row.try_get("routing_id")?;
    let order_ref: String = row.try_get("order_ref")?;
    let retailer_id: String = row.try_get("retailer_id")?;
    let eligible_ids: String = row.try_get("eligible_ids")?;
    let candidate_ids: String = row.try_get("candidate_ids")?;
    let locked_winner: Option<String> = row.try_get("locked_winner")?;
    let locked_at: Option<String> = row.try_get("locked_at")?;
    let version: i64 = row.try_get("version")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(AllocationRouting {
        routing_id: parse_uuid(&routing_id)?,
        order_ref: OrderId::new(parse_uuid(&order_ref)?),
        retailer_id: RetailerId::new(parse_uuid(&retailer_id)?),
        eligible_ids: ids_from_json(&eligible_ids)?,
        candidate_ids: ids_from_json(&candidate_ids)?,
        locked_winner: locked_winner
            .as_deref()
            .map(|raw| parse_uuid(raw).map(WholesalerId::new))
            .transpose()?,
        locked_at: locked_at.as_deref().map(parse_timestamp).transpose()?,
        version,
        status: RoutingStatus::parse(&status)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn response_from_row(row: &SqliteRow) -> Result<CandidateResponse> {
    let routing_id: String = row.try_get("routing_id")?;
    let candidate_id: String = row.try_get("candidate_id")?;
    let kind: String = row.try_get("kind")?;
    let responded_at: String = row.try_get("responded_at")?;
    let note: Option<String> = row.try_get("note")?;

    Ok(CandidateResponse {
        routing_id: parse_uuid(&routing_id)?,
        candidate_id: WholesalerId::new(parse_uuid(&candidate_id)?),
        kind: ResponseKind::parse(&kind)?,
        responded_at: parse_timestamp(&responded_at)?,
        note,
    })
}

fn cancellation_from_row(row: &SqliteRow) -> Result<CancellationRecord> {
    let routing_id: String = row.try_get("routing_id")?;
    let candidate_id: String = row.try_get("candidate_id")?;
    let reason: String = row.try_get("reason")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(CancellationRecord {
        routing_id: parse_uuid(&routing_id)?,
        candidate_id: WholesalerId::new(parse_uuid(&candidate_id)?),
        reason: CancellationReason::parse(&reason)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn profile_from_row(row: &SqliteRow) -> Result<WholesalerProfile> {
    let wholesaler_id: String = row.try_get("wholesaler_id")?;
    let active: bool = row.try_get("active")?;
    let service_areas: String = row.try_get("service_areas")?;
    let stock_available: i64 = row.try_get("stock_available")?;
    let open_capacity: i64 = row.try_get("open_capacity")?;
    let min_order_total: String = row.try_get("min_order_total")?;
    let completion_rate: f64 = row.try_get("completion_rate")?;
    let rating: f64 = row.try_get("rating")?;
    let reliability: f64 = row.try_get("reliability")?;

    Ok(WholesalerProfile {
        wholesaler_id: WholesalerId::new(parse_uuid(&wholesaler_id)?),
        active,
        service_areas: serde_json::from_str(&service_areas)?,
        stock_available,
        open_capacity,
        min_order_total: parse_decimal(&min_order_total)?,
        completion_rate,
        rating,
        reliability,
    })
}

// ---------------------------------------------------------------------------
// connection-level operations

async fn load_routing(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
) -> Result<Option<AllocationRouting>> {
    let row = sqlx::query(
        "SELECT routing_id, order_ref, retailer_id, eligible_ids, candidate_ids, \
                locked_winner, locked_at, version, status, created_at \
         FROM allocation_routings WHERE routing_id = ?",
    )
    .bind(routing_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(routing_from_row).transpose()
}

async fn load_responses(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
) -> Result<Vec<CandidateResponse>> {
    let rows = sqlx::query(
        "SELECT routing_id, candidate_id, kind, responded_at, note \
         FROM candidate_responses WHERE routing_id = ? ORDER BY responded_at, candidate_id",
    )
    .bind(routing_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(response_from_row).collect()
}

async fn load_cancellations(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
) -> Result<Vec<CancellationRecord>> {
    let rows = sqlx::query(
        "SELECT routing_id, candidate_id, reason, created_at \
         FROM cancellation_records WHERE routing_id = ? ORDER BY candidate_id",
    )
    .bind(routing_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(cancellation_from_row).collect()
}

/// Insert a response; a second response from the same candidate is a
/// `DuplicateResponse`.
async fn insert_response_strict(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
    candidate_id: WholesalerId,
    kind: ResponseKind,
    note: Option<String>,
) -> Result<CandidateResponse> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO candidate_responses (routing_id, candidate_id, kind, responded_at, note) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(routing_id.to_string())
    .bind(candidate_id.to_string())
    .bind(kind.as_str())
    .bind(fmt_timestamp(now))
    .bind(note.clone())
    .execute(&mut *conn)
    .await;

    if let Err(err) = result {
        if is_unique_violation(&err) {
            return Err(CoreError::DuplicateResponse {
                routing_id,
                candidate_id: candidate_id.as_uuid(),
            });
        }
        return Err(err.into());
    }

    Ok(CandidateResponse {
        routing_id,
        candidate_id,
        kind,
        responded_at: now,
        note,
    })
}

/// Write a candidate's response slot unconditionally (acceptance paths own
/// their candidate's slot).
async fn upsert_response(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
    candidate_id: WholesalerId,
    kind: ResponseKind,
    note: Option<String>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO candidate_responses (routing_id, candidate_id, kind, responded_at, note) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (routing_id, candidate_id) \
         DO UPDATE SET kind = excluded.kind, responded_at = excluded.responded_at, \
                       note = excluded.note",
    )
    .bind(routing_id.to_string())
    .bind(candidate_id.to_string())
    .bind(kind.as_str())
    .bind(fmt_timestamp(Utc::now()))
    .bind(note)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_cancellation(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
    candidate_id: WholesalerId,
    reason: CancellationReason,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO cancellation_records (routing_id, candidate_id, reason, created_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(routing_id.to_string())
    .bind(candidate_id.to_string())
    .bind(reason.as_str())
    .bind(fmt_timestamp(Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_audit(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
    actor: &str,
    action: &str,
    note: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO routing_audit (audit_id, routing_id, actor, action, note, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::now_v7().to_string())
    .bind(routing_id.to_string())
    .bind(actor)
    .bind(action)
    .bind(note)
    .bind(fmt_timestamp(Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn load_active_profiles(conn: &mut SqliteConnection) -> Result<Vec<WholesalerProfile>> {
    let rows = sqlx::query(
        "SELECT wholesaler_id, active, service_areas, stock_available, open_capacity, \
                min_order_total, completion_rate, rating, reliability \
         FROM wholesaler_profiles WHERE active = 1",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(profile_from_row).collect()
}

async fn load_profile(
    conn: &mut SqliteConnection,
    wholesaler_id: WholesalerId,
) -> Result<Option<WholesalerProfile>> {
    let row = sqlx::query(
        "SELECT wholesaler_id, active, service_areas, stock_available, open_capacity, \
                min_order_total, completion_rate, rating, reliability \
         FROM wholesaler_profiles WHERE wholesaler_id = ?",
    )
    .bind(wholesaler_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(profile_from_row).transpose()
}

async fn upsert_profile_row(
    conn: &mut SqliteConnection,
    profile: &WholesalerProfile,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO wholesaler_profiles \
         (wholesaler_id, active, service_areas, stock_available, open_capacity, \
          min_order_total, completion_rate, rating, reliability) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (wholesaler_id) \
         DO UPDATE SET active = excluded.active, service_areas = excluded.service_areas, \
                       stock_available = excluded.stock_available, \
                       open_capacity = excluded.open_capacity, \
                       min_order_total = excluded.min_order_total, \
                       completion_rate = excluded.completion_rate, \
                       rating = excluded.rating, reliability = excluded.reliability",
    )
    .bind(profile.wholesaler_id.to_string())
    .bind(profile.active)
    .bind(serde_json::to_string(&profile.service_areas)?)
    .bind(profile.stock_available)
    .bind(profile.open_capacity)
    .bind(decimal_to_db(&profile.min_order_total))
    .bind(profile.completion_rate)
    .bind(profile.rating)
    .bind(profile.reliability)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// transaction bodies

async fn broadcast_in_tx(
    conn: &mut SqliteConnection,
    order_id: OrderId,
    retailer_id: RetailerId,
    query: EligibilityQuery,
    config: AllocationConfig,
) -> Result<AllocationRouting> {
    let profiles = load_active_profiles(conn).await?;
    let eligible: Vec<WholesalerProfile> = profiles
        .into_iter()
        .filter(|p| query.matches(p))
        .collect();

    if eligible.is_empty() {
        return Err(CoreError::NoEligibleCandidates {
            order_ref: order_id.as_uuid(),
        });
    }

    let eligible_ids: Vec<WholesalerId> = eligible.iter().map(|p| p.wholesaler_id).collect();
    let ranked = rank_candidates(&config, &eligible);
    let candidate_ids: Vec<WholesalerId> = ranked
        .iter()
        .take(config.top_k)
        .map(|(id, _)| *id)
        .collect();

    let routing = AllocationRouting {
        routing_id: Uuid::now_v7(),
        order_ref: order_id,
        retailer_id,
        eligible_ids,
        candidate_ids,
        locked_winner: None,
        locked_at: None,
        version: 0,
        status: RoutingStatus::Broadcast,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO allocation_routings \
         (routing_id, order_ref, retailer_id, eligible_ids, candidate_ids, locked_winner, \
          locked_at, version, status, created_at) \
         VALUES (?, ?, ?, ?, ?, NULL, NULL, 0, 'BROADCAST', ?)",
    )
    .bind(routing.routing_id.to_string())
    .bind(routing.order_ref.to_string())
    .bind(routing.retailer_id.to_string())
    .bind(ids_to_json(&routing.eligible_ids)?)
    .bind(ids_to_json(&routing.candidate_ids)?)
    .bind(fmt_timestamp(routing.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(routing)
}

enum CasOutcome {
    Won { order_ref: OrderId },
    AlreadyOwn,
    Lost { winner: WholesalerId },
}

async fn accept_cas_in_tx(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
    candidate_id: WholesalerId,
) -> Result<CasOutcome> {
    let affected = sqlx::query(
        "UPDATE allocation_routings \
         SET locked_winner = ?, locked_at = ?, version = version + 1, status = 'LOCKED' \
         WHERE routing_id = ? AND locked_winner IS NULL AND status = 'BROADCAST'",
    )
    .bind(candidate_id.to_string())
    .bind(fmt_timestamp(Utc::now()))
    .bind(routing_id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 1 {
        upsert_response(conn, routing_id, candidate_id, ResponseKind::Accept, None).await?;
        let routing = load_routing(conn, routing_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("routing {}", routing_id)))?;
        return Ok(CasOutcome::Won {
            order_ref: routing.order_ref,
        });
    }

    // Zero rows: someone else resolved the routing between our caller's
    // read and this update
    let routing = load_routing(conn, routing_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("routing {}", routing_id)))?;

    match routing.locked_winner {
        Some(winner) if winner == candidate_id => Ok(CasOutcome::AlreadyOwn),
        Some(winner) => {
            upsert_response(
                conn,
                routing_id,
                candidate_id,
                ResponseKind::Reject,
                Some("another candidate accepted".to_string()),
            )
            .await?;
            Ok(CasOutcome::Lost { winner })
        }
        None => Err(CoreError::InvalidState(format!(
            "routing {} is {} and cannot be locked",
            routing_id, routing.status
        ))),
    }
}

async fn cancel_losers_in_tx(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
    winner_id: WholesalerId,
) -> Result<Vec<CancellationRecord>> {
    let routing = load_routing(conn, routing_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("routing {}", routing_id)))?;

    match routing.locked_winner {
        Some(winner) if winner == winner_id => {}
        Some(winner) => {
            return Err(CoreError::InvalidState(format!(
                "routing {} is locked by {}, not {}",
                routing_id, winner, winner_id
            )));
        }
        None => {
            return Err(CoreError::InvalidState(format!(
                "routing {} has no locked winner to cancel against",
                routing_id
            )));
        }
    }

    let responses: HashMap<WholesalerId, ResponseKind> = load_responses(conn, routing_id)
        .await?
        .into_iter()
        .map(|r| (r.candidate_id, r.kind))
        .collect();

    for candidate in routing.candidate_ids.iter().filter(|c| **c != winner_id) {
        let reason = match responses.get(candidate) {
            Some(ResponseKind::Accept) => CancellationReason::LostRace,
            Some(ResponseKind::Timeout) => CancellationReason::TimedOut,
            _ => CancellationReason::NotSelected,
        };
        insert_cancellation(conn, routing_id, *candidate, reason).await?;
    }

    sqlx::query(
        "UPDATE allocation_routings SET status = 'CANCELLATIONS_SENT', version = version + 1 \
         WHERE routing_id = ? AND status = 'LOCKED'",
    )
    .bind(routing_id.to_string())
    .execute(&mut *conn)
    .await?;

    load_cancellations(conn, routing_id).await
}

async fn timeout_in_tx(
    conn: &mut SqliteConnection,
    routing_id: Uuid,
    ttl: chrono::Duration,
    config: AllocationConfig,
) -> Result<(TimeoutOutcome, OrderId)> {
    let routing = load_routing(conn, routing_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("routing {}", routing_id)))?;

    let empty = TimeoutOutcome {
        timed_out: Vec::new(),
        auto_selected: None,
    };

    if routing.status == RoutingStatus::Closed {
        return Ok((empty, routing.order_ref));
    }

    if Utc::now() < routing.created_at + ttl {
        return Ok((empty, routing.order_ref));
    }

    let responses = load_responses(conn, routing_id).await?;
    let responded: HashMap<WholesalerId, ResponseKind> = responses
        .into_iter()
        .map(|r| (r.candidate_id, r.kind))
        .collect();

    let mut timed_out = Vec::new();
    for candidate in &routing.candidate_ids {
        if !responded.contains_key(candidate) {
            upsert_response(
                conn,
                routing_id,
                *candidate,
                ResponseKind::Timeout,
                Some("no response within ttl".to_string()),
            )
            .await?;
            timed_out.push(*candidate);
        }
    }

    let mut auto_selected = None;
    if routing.locked_winner.is_none()
        && routing.status == RoutingStatus::Broadcast
        && config.auto_select_on_timeout
    {
        let mut acceptors = Vec::new();
        for candidate in &routing.candidate_ids {
            if responded.get(candidate) == Some(&ResponseKind::Accept) {
                if let Some(profile) = load_profile(conn, *candidate).await? {
                    acceptors.push(profile);
                }
            }
        }

        if let Some((best, _)) = rank_candidates(&config, &acceptors).first() {
            let affected = sqlx::query(
                "UPDATE allocation_routings \
                 SET locked_winner = ?, locked_at = ?, version = version + 1, status = 'LOCKED' \
                 WHERE routing_id = ? AND locked_winner IS NULL AND status = 'BROADCAST'",
            )
            .bind(best.to_string())
            .bind(fmt_timestamp(Utc::now()))
            .bind(routing_id.to_string())
            .execute(&mut *conn)
            .await?
            .rows_affected();

            if affected == 1 {
                auto_selected = Some(*best);
            }
        }
    }

    Ok((
        TimeoutOutcome {
            timed_out,
            auto_selected,
        },
        routing.order_ref,
    ))
}

// ---------------------------------------------------------------------------
// engine

/// Allocation race resolver
pub struct AllocationEngine {
    executor: Arc<TxExecutor>,
    config: AllocationConfig,
    notifier: Arc<dyn Notifier>,
}

impl AllocationEngine {
    /// Create an engine with the default (discarding) notifier
    pub fn new(executor: Arc<TxExecutor>, config: AllocationConfig) -> Self {
        Self {
            executor,
            config,
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Attach the messaging collaborator
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Create or update a wholesaler's candidate profile
    pub async fn upsert_profile(&self, profile: WholesalerProfile) -> Result<()> {
        self.executor
            .run(move |conn| {
                let profile = profile.clone();
                Box::pin(async move { upsert_profile_row(conn, &profile).await })
            })
            .await
    }

    /// Load a candidate profile
    pub async fn profile(&self, wholesaler_id: WholesalerId) -> Result<Option<WholesalerProfile>> {
        self.executor
            .run_read(move |conn| Box::pin(async move { load_profile(conn, wholesaler_id).await }))
            .await
    }

    /// Load a routing
    pub async fn routing(&self, routing_id: Uuid) -> Result<Option<AllocationRouting>> {
        self.executor
            .run_read(move |conn| Box::pin(async move { load_routing(conn, routing_id).await }))
            .await
    }

    /// Responses recorded for a routing
    pub async fn responses(&self, routing_id: Uuid) -> Result<Vec<CandidateResponse>> {
        self.executor
            .run_read(move |conn| Box::pin(async move { load_responses(conn, routing_id).await }))
            .await
    }

    /// Cancellations recorded for a routing
    pub async fn cancellations(&self, routing_id: Uuid) -> Result<Vec<CancellationRecord>> {
        self.executor
            .run_read(move |conn| {
                Box::pin(async move { load_cancellations(conn, routing_id).await })
            })
            .await
    }

    /// Open a routing: evaluate eligibility, rank, invite the top-K, and
    /// record the full eligible set for audit. Invitations go out only
    /// after the routing row is committed.
    pub async fn broadcast(
        &self,
        order_id: OrderId,
        retailer_id: RetailerId,
        query: EligibilityQuery,
    ) -> Result<AllocationRouting> {
        let config = self.config.clone();
        let routing = self
            .executor
            .run(move |conn| {
                let query = query.clone();
                let config = config.clone();
                Box::pin(async move {
                    broadcast_in_tx(conn, order_id, retailer_id, query, config).await
                })
            })
            .await?;

        tracing::info!(
            routing = %routing.routing_id,
            order = %order_id,
            eligible = routing.eligible_ids.len(),
            invited = routing.candidate_ids.len(),
            "routing broadcast"
        );

        let notices = routing
            .candidate_ids
            .iter()
            .map(|candidate| OutboundNotice::Invitation {
                routing_id: routing.routing_id,
                candidate_id: *candidate,
                order_ref: routing.order_ref,
            })
            .collect();
        self.dispatch(notices).await;

        Ok(routing)
    }

    /// Record a candidate's answer. Never decides a winner.
    pub async fn respond(
        &self,
        routing_id: Uuid,
        candidate_id: WholesalerId,
        kind: ResponseKind,
        note: Option<String>,
    ) -> Result<CandidateResponse> {
        self.executor
            .run(move |conn| {
                let note = note.clone();
                Box::pin(async move {
                    let routing = load_routing(conn, routing_id)
                        .await?
                        .ok_or_else(|| CoreError::NotFound(format!("routing {}", routing_id)))?;

                    if routing.status == RoutingStatus::Closed {
                        return Err(CoreError::InvalidState(format!(
                            "routing {} is closed",
                            routing_id
                        )));
                    }

                    if !routing.candidate_ids.contains(&candidate_id) {
                        return Err(CoreError::InvalidState(format!(
                            "wholesaler {} was not invited to routing {}",
                            candidate_id, routing_id
                        )));
                    }

                    insert_response_strict(conn, routing_id, candidate_id, kind, note).await
                })
            })
            .await
    }

    /// Try to take the order. Exactly one concurrent caller wins; the rest
    /// learn who did. Losing is a normal outcome, not an error.
    pub async fn accept_candidate(
        &self,
        routing_id: Uuid,
        candidate_id: WholesalerId,
    ) -> Result<AcceptanceResult> {
        // Cheap pre-read; the conditional update below is the decision
        let routing = self
            .routing(routing_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("routing {}", routing_id)))?;

        if routing.status == RoutingStatus::Closed {
            return Err(CoreError::InvalidState(format!(
                "routing {} is closed",
                routing_id
            )));
        }

        if !routing.candidate_ids.contains(&candidate_id) {
            return Err(CoreError::InvalidState(format!(
                "wholesaler {} was not invited to routing {}",
                candidate_id, routing_id
            )));
        }

        match routing.locked_winner {
            Some(winner) if winner == candidate_id => {
                tracing::debug!(routing = %routing_id, candidate = %candidate_id, "repeat acceptance");
                return Ok(AcceptanceResult {
                    accepted: true,
                    reason: AcceptReason::AlreadyAccepted,
                    locked_candidate: Some(winner),
                });
            }
            Some(winner) => {
                tracing::debug!(routing = %routing_id, candidate = %candidate_id, winner = %winner, "routing already locked");
                return Ok(AcceptanceResult {
                    accepted: false,
                    reason: AcceptReason::AlreadyLocked,
                    locked_candidate: Some(winner),
                });
            }
            None => {}
        }

        let cas = self
            .executor
            .run(move |conn| {
                Box::pin(async move { accept_cas_in_tx(conn, routing_id, candidate_id).await })
            })
            .await?;

        match cas {
            CasOutcome::Won { order_ref } => {
                tracing::info!(routing = %routing_id, winner = %candidate_id, "routing locked");

                self.dispatch(vec![OutboundNotice::WinnerConfirmation {
                    routing_id,
                    candidate_id,
                    order_ref,
                }])
                .await;

                // Fan-out runs strictly after the lock committed; it is
                // idempotent, so the scheduler can re-drive it if this
                // call dies here
                if let Err(err) = self.cancel_losers(routing_id, candidate_id).await {
                    tracing::warn!(routing = %routing_id, error = %err, "loser fan-out failed");
                }

                Ok(AcceptanceResult {
                    accepted: true,
                    reason: AcceptReason::Locked,
                    locked_candidate: Some(candidate_id),
                })
            }
            CasOutcome::AlreadyOwn => Ok(AcceptanceResult {
                accepted: true,
                reason: AcceptReason::AlreadyAccepted,
                locked_candidate: Some(candidate_id),
            }),
            CasOutcome::Lost { winner } => {
                tracing::debug!(routing = %routing_id, candidate = %candidate_id, winner = %winner, "lost acceptance race");
                Ok(AcceptanceResult {
                    accepted: false,
                    reason: AcceptReason::LostRace,
                    locked_candidate: Some(winner),
                })
            }
        }
    }

    /// Record cancellations for every invited non-winner and notify them.
    /// Race-free by construction: only callable against a locked routing.
    pub async fn cancel_losers(
        &self,
        routing_id: Uuid,
        winner_id: WholesalerId,
    ) -> Result<Vec<CancellationRecord>> {
        let records = self
            .executor
            .run(move |conn| {
                Box::pin(async move { cancel_losers_in_tx(conn, routing_id, winner_id).await })
            })
            .await?;

        let notices = records
            .iter()
            .map(|record| OutboundNotice::Cancellation {
                routing_id,
                candidate_id: record.candidate_id,
                reason: record.reason,
            })
            .collect();
        self.dispatch(notices).await;

        Ok(records)
    }

    /// Record TIMEOUT responses for invitees still silent after `ttl`;
    /// if the routing is still open, lock the best current acceptor
    /// (when auto-selection is enabled).
    pub async fn timeout_non_responders(
        &self,
        routing_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<TimeoutOutcome> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| CoreError::InvalidState(format!("ttl {:?} out of range", ttl)))?;

        let config = self.config.clone();
        let (outcome, order_ref) = self
            .executor
            .run(move |conn| {
                let config = config.clone();
                Box::pin(async move { timeout_in_tx(conn, routing_id, ttl, config).await })
            })
            .await?;

        if !outcome.timed_out.is_empty() {
            tracing::info!(
                routing = %routing_id,
                timed_out = outcome.timed_out.len(),
                "non-responders marked"
            );
        }

        if let Some(winner) = outcome.auto_selected {
            tracing::info!(routing = %routing_id, winner = %winner, "auto-selected best acceptor");

            self.dispatch(vec![OutboundNotice::WinnerConfirmation {
                routing_id,
                candidate_id: winner,
                order_ref,
            }])
            .await;

            if let Err(err) = self.cancel_losers(routing_id, winner).await {
                tracing::warn!(routing = %routing_id, error = %err, "loser fan-out failed");
            }
        }

        Ok(outcome)
    }

    /// Administrative reset: the only path that clears a winner. Closes
    /// the routing and leaves an audit row; there is no silent reopening.
    pub async fn admin_reset(
        &self,
        routing_id: Uuid,
        actor: &str,
        note: &str,
    ) -> Result<AllocationRouting> {
        let actor_owned = actor.to_string();
        let note_owned = note.to_string();

        let routing = self
            .executor
            .run(move |conn| {
                let actor = actor_owned.clone();
                let note = note_owned.clone();
                Box::pin(async move {
                    let routing = load_routing(conn, routing_id)
                        .await?
                        .ok_or_else(|| CoreError::NotFound(format!("routing {}", routing_id)))?;

                    if routing.status == RoutingStatus::Closed {
                        return Err(CoreError::InvalidState(format!(
                            "routing {} is already closed",
                            routing_id
                        )));
                    }

                    sqlx::query(
                        "UPDATE allocation_routings \
                         SET locked_winner = NULL, locked_at = NULL, status = 'CLOSED', \
                             version = version + 1 \
                         WHERE routing_id = ?",
                    )
                    .bind(routing_id.to_string())
                    .execute(&mut *conn)
                    .await?;

                    insert_audit(conn, routing_id, &actor, "RESET", &note).await?;

                    load_routing(conn, routing_id)
                        .await?
                        .ok_or_else(|| CoreError::NotFound(format!("routing {}", routing_id)))
                })
            })
            .await?;

        tracing::warn!(routing = %routing_id, actor, note, "routing reset and closed by administrator");

        Ok(routing)
    }

    async fn dispatch(&self, notices: Vec<OutboundNotice>) {
        for notice in notices {
            if let Err(err) = self.notifier.notify(notice).await {
                // The decision is already committed; delivery problems are
                // the messaging layer's to retry
                tracing::warn!(error = %err, "notification dispatch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::RecordingNotifier;
    use rust_decimal::Decimal;
    use store_core::config::{RetryConfig, StoreConfig};
    use store_core::db::connect_and_init;

    async fn fixture() -> (
        tempfile::TempDir,
        Arc<RecordingNotifier>,
        AllocationEngine,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("core.db"),
            ..StoreConfig::default()
        };
        let pool = connect_and_init(&config).await.unwrap();
        let executor = Arc::new(TxExecutor::new(pool, RetryConfig::default()));
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = AllocationEngine::new(executor, AllocationConfig::default())
            .with_notifier(notifier.clone());
        (dir, notifier, engine)
    }

    fn profile(area: &str, rating: f64) -> WholesalerProfile {
        WholesalerProfile {
            wholesaler_id: WholesalerId::generate(),
            active: true,
            service_areas: vec![area.to_string()],
            stock_available: 1_000,
            open_capacity: 10,
            min_order_total: Decimal::ZERO,
            completion_rate: 0.9,
            rating,
            reliability: 0.9,
        }
    }

    fn query(area: &str) -> EligibilityQuery {
        EligibilityQuery {
            service_area: area.to_string(),
            units_required: 10,
            order_total: Decimal::from(500),
        }
    }

    async fn seeded_routing(
        engine: &AllocationEngine,
        candidates: usize,
    ) -> (AllocationRouting, Vec<WholesalerId>) {
        let mut ids = Vec::new();
        for i in 0..candidates {
            let p = profile("kibera", 3.0 + i as f64 * 0.1);
            ids.push(p.wholesaler_id);
            engine.upsert_profile(p).await.unwrap();
        }
        let routing = engine
            .broadcast(OrderId::generate(), RetailerId::generate(), query("kibera"))
            .await
            .unwrap();
        (routing, ids)
    }

    #[tokio::test]
    async fn test_broadcast_filters_and_ranks() {
        let (_dir, notifier, engine) = fixture().await;

        let good = profile("kibera", 4.9);
        let mid = profile("kibera", 3.0);
        let wrong_area = profile("eastleigh", 5.0);
        let mut inactive = profile("kibera", 5.0);
        inactive.active = false;

        for p in [good.clone(), mid.clone(), wrong_area, inactive] {
            engine.upsert_profile(p).await.unwrap();
        }

        let routing = engine
            .broadcast(OrderId::generate(), RetailerId::generate(), query("kibera"))
            .await
            .unwrap();

        assert_eq!(routing.status, RoutingStatus::Broadcast);
        assert_eq!(routing.eligible_ids.len(), 2);
        assert_eq!(routing.candidate_ids[0], good.wholesaler_id);
        assert_eq!(routing.candidate_ids[1], mid.wholesaler_id);
        assert!(routing.locked_winner.is_none());

        // Both invitees notified, after commit
        let invitations = notifier
            .notices()
            .into_iter()
            .filter(|n| matches!(n, OutboundNotice::Invitation { .. }))
            .count();
        assert_eq!(invitations, 2);
    }

    #[tokio::test]
    async fn test_broadcast_caps_at_top_k() {
        let (_dir, _notifier, engine) = fixture().await;
        let (routing, _) = seeded_routing(&engine, 14).await;

        assert_eq!(routing.eligible_ids.len(), 14);
        assert_eq!(routing.candidate_ids.len(), 10);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_candidates() {
        let (_dir, _notifier, engine) = fixture().await;

        let result = engine
            .broadcast(OrderId::generate(), RetailerId::generate(), query("kibera"))
            .await;

        assert!(matches!(
            result,
            Err(CoreError::NoEligibleCandidates { .. })
        ));
    }

    #[tokio::test]
    async fn test_respond_once_only() {
        let (_dir, _notifier, engine) = fixture().await;
        let (routing, ids) = seeded_routing(&engine, 3).await;

        engine
            .respond(routing.routing_id, ids[0], ResponseKind::Accept, None)
            .await
            .unwrap();

        let result = engine
            .respond(routing.routing_id, ids[0], ResponseKind::Reject, None)
            .await;
        assert!(matches!(result, Err(CoreError::DuplicateResponse { .. })));

        // Responding never locks anything
        let fresh = engine.routing(routing.routing_id).await.unwrap().unwrap();
        assert!(fresh.locked_winner.is_none());
    }

    #[tokio::test]
    async fn test_respond_requires_invitation() {
        let (_dir, _notifier, engine) = fixture().await;
        let (routing, _) = seeded_routing(&engine, 2).await;

        let result = engine
            .respond(
                routing.routing_id,
                WholesalerId::generate(),
                ResponseKind::Accept,
                None,
            )
            .await;
        assert!(matches!(result, Err(CoreError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_accept_locks_and_is_idempotent() {
        let (_dir, _notifier, engine) = fixture().await;
        let (routing, ids) = seeded_routing(&engine, 3).await;

        let first = engine
            .accept_candidate(routing.routing_id, ids[0])
            .await
            .unwrap();
        assert!(first.accepted);
        assert_eq!(first.reason, AcceptReason::Locked);
        assert_eq!(first.locked_candidate, Some(ids[0]));

        let repeat = engine
            .accept_candidate(routing.routing_id, ids[0])
            .await
            .unwrap();
        assert!(repeat.accepted);
        assert_eq!(repeat.reason, AcceptReason::AlreadyAccepted);

        // Version advanced by the lock and the fan-out only
        let fresh = engine.routing(routing.routing_id).await.unwrap().unwrap();
        assert_eq!(fresh.locked_winner, Some(ids[0]));
        assert_eq!(fresh.status, RoutingStatus::CancellationsSent);
        assert!(fresh.locked_at.is_some());
    }

    #[tokio::test]
    async fn test_second_acceptor_learns_the_winner() {
        let (_dir, notifier, engine) = fixture().await;
        let (routing, ids) = seeded_routing(&engine, 3).await;

        engine
            .accept_candidate(routing.routing_id, ids[0])
            .await
            .unwrap();

        let loser = engine
            .accept_candidate(routing.routing_id, ids[1])
            .await
            .unwrap();
        assert!(!loser.accepted);
        assert_eq!(loser.reason, AcceptReason::AlreadyLocked);
        assert_eq!(loser.locked_candidate, Some(ids[0]));

        // Losers were cancelled and notified after the lock
        let cancellations = engine
            .cancellations(routing.routing_id)
            .await
            .unwrap();
        assert_eq!(cancellations.len(), 2);

        let cancel_notices = notifier
            .notices()
            .into_iter()
            .filter(|n| matches!(n, OutboundNotice::Cancellation { .. }))
            .count();
        assert_eq!(cancel_notices, 2);
    }

    #[tokio::test]
    async fn test_timeout_marks_silent_candidates() {
        let (_dir, _notifier, engine) = fixture().await;
        let (routing, ids) = seeded_routing(&engine, 3).await;

        engine
            .respond(routing.routing_id, ids[0], ResponseKind::Reject, None)
            .await
            .unwrap();

        let outcome = engine
            .timeout_non_responders(routing.routing_id, std::time::Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(outcome.timed_out.len(), 2);
        assert!(outcome.auto_selected.is_none(), "nobody accepted");

        let responses = engine.responses(routing.routing_id).await.unwrap();
        assert_eq!(responses.len(), 3);
    }

    #[tokio::test]
    async fn test_timeout_before_ttl_is_noop() {
        let (_dir, _notifier, engine) = fixture().await;
        let (routing, _) = seeded_routing(&engine, 3).await;

        let outcome = engine
            .timeout_non_responders(routing.routing_id, std::time::Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(outcome.timed_out.is_empty());
        assert!(outcome.auto_selected.is_none());
        assert!(engine.responses(routing.routing_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_auto_selects_best_acceptor() {
        let (_dir, _notifier, engine) = fixture().await;

        let strong = profile("kibera", 4.9);
        let weak = profile("kibera", 2.0);
        engine.upsert_profile(strong.clone()).await.unwrap();
        engine.upsert_profile(weak.clone()).await.unwrap();

        let routing = engine
            .broadcast(OrderId::generate(), RetailerId::generate(), query("kibera"))
            .await
            .unwrap();

        engine
            .respond(
                routing.routing_id,
                strong.wholesaler_id,
                ResponseKind::Accept,
                None,
            )
            .await
            .unwrap();
        engine
            .respond(
                routing.routing_id,
                weak.wholesaler_id,
                ResponseKind::Accept,
                None,
            )
            .await
            .unwrap();

        let outcome = engine
            .timeout_non_responders(routing.routing_id, std::time::Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(outcome.auto_selected, Some(strong.wholesaler_id));

        let fresh = engine.routing(routing.routing_id).await.unwrap().unwrap();
        assert_eq!(fresh.locked_winner, Some(strong.wholesaler_id));
        assert_eq!(fresh.status, RoutingStatus::CancellationsSent);
    }

    #[tokio::test]
    async fn test_admin_reset_closes_and_audits() {
        let (_dir, _notifier, engine) = fixture().await;
        let (routing, ids) = seeded_routing(&engine, 2).await;

        engine
            .accept_candidate(routing.routing_id, ids[0])
            .await
            .unwrap();

        let closed = engine
            .admin_reset(routing.routing_id, "ops@sokoni", "duplicate order")
            .await
            .unwrap();
        assert_eq!(closed.status, RoutingStatus::Closed);
        assert!(closed.locked_winner.is_none());

        // Closed means closed: no acceptance, no second reset
        let result = engine.accept_candidate(routing.routing_id, ids[1]).await;
        assert!(matches!(result, Err(CoreError::InvalidState(_))));

        let again = engine
            .admin_reset(routing.routing_id, "ops@sokoni", "again")
            .await;
        assert!(matches!(again, Err(CoreError::InvalidState(_))));
    }
}
