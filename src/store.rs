// ABOUTME: Concurrent in-memory stores for clients, flow artifacts, and tokens
// ABOUTME: Reader-writer maps with TTL sweeping, sealing at rest, and idempotent stop
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # Authorization store
//!
//! All mutable state lives here: registered clients, pending flow state,
//! authorization codes, refresh tokens, and upstream tokens. Maps sit behind
//! reader-writer locks with short critical sections; nothing holds a lock
//! across an outbound call. Upstream token material is sealed with
//! AES-256-GCM when a key is configured.
//!
//! The upstream-token map (keyed by user email) and the bearer index (keyed
//! by issued access token) live behind a single lock so the pair always
//! commits atomically: a concurrent resolver sees either the old consistent
//! pair or the new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::constants::{cleanup, lifetimes};
use crate::crypto::{CryptoError, TokenCipher};
use crate::models::{
    AuthorizationCode, FlowState, RefreshTokenRecord, RegisteredClient, UpstreamToken, UserInfo,
};

/// Store failures. Sealing errors are the only fallible path; map access
/// itself cannot fail.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Sealing or opening token material failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Entry in the bearer index, pointing at the owning user.
#[derive(Debug, Clone)]
struct BearerEntry {
    user_email: String,
    expires_at: DateTime<Utc>,
}

/// A refresh token retired by rotation, kept for reuse detection.
#[derive(Debug, Clone)]
struct RotatedRefresh {
    user_email: String,
    retired_at: DateTime<Utc>,
}

/// The two token maps that must stay consistent with each other.
#[derive(Debug, Default)]
struct TokenMaps {
    by_email: HashMap<String, UpstreamToken>,
    bearers: HashMap<String, BearerEntry>,
}

/// A bearer resolved to its owner and (unsealed) upstream token.
#[derive(Debug, Clone)]
pub struct ResolvedBearer {
    /// Owning user email.
    pub user_email: String,
    /// The upstream token, unsealed.
    pub upstream: UpstreamToken,
    /// Expiry of the bearer itself.
    pub expires_at: DateTime<Utc>,
}

/// The in-memory authorization store.
pub struct AuthStore {
    clients: RwLock<HashMap<String, RegisteredClient>>,
    registrations_by_ip: RwLock<HashMap<String, u32>>,
    flow_states: RwLock<HashMap<String, FlowState>>,
    auth_codes: RwLock<HashMap<String, AuthorizationCode>>,
    refresh_tokens: RwLock<HashMap<String, RefreshTokenRecord>>,
    rotated_refresh: RwLock<HashMap<String, RotatedRefresh>>,
    tokens: RwLock<TokenMaps>,
    user_info: DashMap<String, UserInfo>,
    cipher: TokenCipher,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl AuthStore {
    /// Create a store sealing token material with the given cipher.
    #[must_use]
    pub fn new(cipher: TokenCipher) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            clients: RwLock::new(HashMap::new()),
            registrations_by_ip: RwLock::new(HashMap::new()),
            flow_states: RwLock::new(HashMap::new()),
            auth_codes: RwLock::new(HashMap::new()),
            refresh_tokens: RwLock::new(HashMap::new()),
            rotated_refresh: RwLock::new(HashMap::new()),
            tokens: RwLock::new(TokenMaps::default()),
            user_info: DashMap::new(),
            cipher,
            stopped: AtomicBool::new(false),
            shutdown_tx,
            sweeper: StdMutex::new(None),
        }
    }

    /// Spawn the TTL sweep loop. Call once after wrapping the store in `Arc`.
    pub fn start_sweeper(self: &std::sync::Arc<Self>, interval: StdDuration) {
        let store = std::sync::Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.sweep_once(Utc::now()).await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("store sweeper stopped");
        });
        if let Ok(mut slot) = self.sweeper.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop the sweep loop. Idempotent under concurrent callers; only the
    /// first call performs the shutdown, later calls return immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("authorization store stopped");
    }

    /// Whether `stop` has completed at least once.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ── Clients ─────────────────────────────────────────────────────────

    /// Insert a registered client, charging its source IP quota.
    pub async fn insert_client(&self, client: RegisteredClient) {
        if let Some(ip) = client.registered_from.clone() {
            let mut counts = self.registrations_by_ip.write().await;
            *counts.entry(ip).or_insert(0) += 1;
        }
        self.clients
            .write()
            .await
            .insert(client.client_id.clone(), client);
    }

    /// Look up a client by identifier.
    pub async fn get_client(&self, client_id: &str) -> Option<RegisteredClient> {
        self.clients.read().await.get(client_id).cloned()
    }

    /// Remove a client, releasing its source IP quota.
    pub async fn remove_client(&self, client_id: &str) -> bool {
        let removed = self.clients.write().await.remove(client_id);
        if let Some(client) = &removed {
            if let Some(ip) = &client.registered_from {
                let mut counts = self.registrations_by_ip.write().await;
                if let Some(count) = counts.get_mut(ip) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        counts.remove(ip);
                    }
                }
            }
        }
        removed.is_some()
    }

    /// Number of active registrations from a source IP.
    pub async fn registrations_from(&self, ip: &str) -> u32 {
        self.registrations_by_ip
            .read()
            .await
            .get(ip)
            .copied()
            .unwrap_or(0)
    }

    // ── Flow state ──────────────────────────────────────────────────────

    /// Persist flow state under its upstream state token.
    pub async fn put_flow_state(&self, upstream_state: String, flow: FlowState) {
        self.flow_states.write().await.insert(upstream_state, flow);
    }

    /// Consume flow state. Returns `None` for unknown or expired entries;
    /// the entry is removed either way.
    pub async fn take_flow_state(&self, upstream_state: &str) -> Option<FlowState> {
        let flow = self.flow_states.write().await.remove(upstream_state)?;
        if flow.is_expired(Utc::now()) {
            return None;
        }
        Some(flow)
    }

    // ── Authorization codes ─────────────────────────────────────────────

    /// Store an authorization code, sealing the bound upstream token.
    ///
    /// # Errors
    /// Returns an error if sealing fails.
    pub async fn put_auth_code(
        &self,
        code: String,
        mut record: AuthorizationCode,
    ) -> Result<(), StoreError> {
        record.upstream = self.seal_token(&record.upstream)?;
        self.auth_codes.write().await.insert(code, record);
        Ok(())
    }

    /// Retrieve and delete an authorization code in one critical section.
    /// At most one caller can ever observe a given code.
    ///
    /// # Errors
    /// Returns an error if unsealing fails.
    pub async fn take_auth_code(
        &self,
        code: &str,
    ) -> Result<Option<AuthorizationCode>, StoreError> {
        let record = self.auth_codes.write().await.remove(code);
        let Some(mut record) = record else {
            return Ok(None);
        };
        if record.is_expired(Utc::now()) {
            return Ok(None);
        }
        record.upstream = self.open_token(&record.upstream)?;
        Ok(Some(record))
    }

    // ── Refresh tokens ──────────────────────────────────────────────────

    /// Store a refresh token mapping.
    pub async fn put_refresh_token(&self, token: String, record: RefreshTokenRecord) {
        self.refresh_tokens.write().await.insert(token, record);
    }

    /// Look up a refresh token. Expired entries resolve to `None`.
    pub async fn get_refresh_token(&self, token: &str) -> Option<RefreshTokenRecord> {
        let record = self.refresh_tokens.read().await.get(token).cloned()?;
        if record.expires_at <= Utc::now() {
            return None;
        }
        Some(record)
    }

    /// Rotate a refresh token: retire the old string, install the new one.
    /// Both writes happen in one critical section per map, old first, so a
    /// reuse probe can never see the old token as live after the new one is
    /// visible.
    pub async fn rotate_refresh_token(
        &self,
        old_token: &str,
        new_token: String,
        record: RefreshTokenRecord,
    ) {
        let retired = {
            let mut live = self.refresh_tokens.write().await;
            let removed = live.remove(old_token);
            live.insert(new_token, record.clone());
            removed
        };
        if retired.is_some() {
            self.rotated_refresh.write().await.insert(
                old_token.to_owned(),
                RotatedRefresh {
                    user_email: record.user_email,
                    retired_at: Utc::now(),
                },
            );
        }
    }

    /// Whether a token was retired by rotation. Returns the owning user.
    pub async fn rotated_owner(&self, token: &str) -> Option<String> {
        self.rotated_refresh
            .read()
            .await
            .get(token)
            .map(|r| r.user_email.clone())
    }

    /// Remove one refresh token (revocation endpoint).
    pub async fn remove_refresh_token(&self, token: &str) -> bool {
        self.refresh_tokens.write().await.remove(token).is_some()
    }

    /// Revoke every refresh token belonging to a user, live and retired.
    /// Returns the number of live tokens removed.
    pub async fn revoke_refresh_tokens_for(&self, user_email: &str) -> usize {
        let removed = {
            let mut live = self.refresh_tokens.write().await;
            let before = live.len();
            live.retain(|_, record| record.user_email != user_email);
            before - live.len()
        };
        self.rotated_refresh
            .write()
            .await
            .retain(|_, record| record.user_email != user_email);
        removed
    }

    // ── Upstream tokens and the bearer index ────────────────────────────

    /// Save an upstream token under the user email and, optionally, a bearer
    /// access token. Both keys commit in one critical section.
    ///
    /// # Errors
    /// Returns an error if sealing fails.
    pub async fn save_upstream_token(
        &self,
        user_email: &str,
        token: &UpstreamToken,
        bearer: Option<(&str, DateTime<Utc>)>,
    ) -> Result<(), StoreError> {
        let sealed = self.seal_token(token)?;
        let mut maps = self.tokens.write().await;
        maps.by_email.insert(user_email.to_owned(), sealed);
        if let Some((bearer_token, expires_at)) = bearer {
            maps.bearers.insert(
                bearer_token.to_owned(),
                BearerEntry {
                    user_email: user_email.to_owned(),
                    expires_at,
                },
            );
        }
        Ok(())
    }

    /// Resolve a server-issued bearer to its owner and upstream token.
    ///
    /// # Errors
    /// Returns an error if unsealing fails.
    pub async fn resolve_bearer(
        &self,
        bearer: &str,
    ) -> Result<Option<ResolvedBearer>, StoreError> {
        let maps = self.tokens.read().await;
        let Some(entry) = maps.bearers.get(bearer) else {
            return Ok(None);
        };
        if entry.expires_at <= Utc::now() {
            return Ok(None);
        }
        let Some(sealed) = maps.by_email.get(&entry.user_email) else {
            return Ok(None);
        };
        let upstream = self.open_token(sealed)?;
        Ok(Some(ResolvedBearer {
            user_email: entry.user_email.clone(),
            upstream,
            expires_at: entry.expires_at,
        }))
    }

    /// Fetch the upstream token for a user.
    ///
    /// # Errors
    /// Returns an error if unsealing fails.
    pub async fn get_upstream_by_email(
        &self,
        user_email: &str,
    ) -> Result<Option<UpstreamToken>, StoreError> {
        let maps = self.tokens.read().await;
        match maps.by_email.get(user_email) {
            Some(sealed) => Ok(Some(self.open_token(sealed)?)),
            None => Ok(None),
        }
    }

    /// Remove one bearer mapping (revocation endpoint).
    pub async fn remove_bearer(&self, bearer: &str) -> bool {
        self.tokens.write().await.bearers.remove(bearer).is_some()
    }

    /// Drop a user's upstream token and every bearer pointing at it.
    pub async fn remove_user_tokens(&self, user_email: &str) {
        let mut maps = self.tokens.write().await;
        maps.by_email.remove(user_email);
        maps.bearers
            .retain(|_, entry| entry.user_email != user_email);
    }

    // ── User info cache ─────────────────────────────────────────────────

    /// Cache user info by email.
    pub fn cache_user_info(&self, info: UserInfo) {
        self.user_info.insert(info.email.clone(), info);
    }

    /// Cached user info for a user, if present.
    #[must_use]
    pub fn get_user_info(&self, user_email: &str) -> Option<UserInfo> {
        self.user_info.get(user_email).map(|entry| entry.clone())
    }

    // ── Sweeping ────────────────────────────────────────────────────────

    /// One TTL sweep pass. Expired keys are collected under read locks, then
    /// deleted under write locks with a re-check, bounded per map so writers
    /// are never starved.
    pub async fn sweep_once(&self, now: DateTime<Utc>) {
        let expired_flows: Vec<String> = {
            let flows = self.flow_states.read().await;
            flows
                .iter()
                .filter(|(_, flow)| flow.is_expired(now))
                .take(cleanup::SWEEP_BATCH_LIMIT)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if !expired_flows.is_empty() {
            let mut flows = self.flow_states.write().await;
            for key in &expired_flows {
                if flows.get(key).is_some_and(|flow| flow.is_expired(now)) {
                    flows.remove(key);
                }
            }
        }

        let expired_codes: Vec<String> = {
            let codes = self.auth_codes.read().await;
            codes
                .iter()
                .filter(|(_, code)| code.is_expired(now))
                .take(cleanup::SWEEP_BATCH_LIMIT)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if !expired_codes.is_empty() {
            let mut codes = self.auth_codes.write().await;
            for key in &expired_codes {
                if codes.get(key).is_some_and(|code| code.is_expired(now)) {
                    codes.remove(key);
                }
            }
        }

        let expired_refresh: Vec<String> = {
            let tokens = self.refresh_tokens.read().await;
            tokens
                .iter()
                .filter(|(_, record)| record.expires_at <= now)
                .take(cleanup::SWEEP_BATCH_LIMIT)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if !expired_refresh.is_empty() {
            let mut tokens = self.refresh_tokens.write().await;
            for key in &expired_refresh {
                if tokens.get(key).is_some_and(|r| r.expires_at <= now) {
                    tokens.remove(key);
                }
            }
        }

        let retention = Duration::seconds(lifetimes::ROTATED_REFRESH_RETENTION_SECS);
        let stale_rotated: Vec<String> = {
            let rotated = self.rotated_refresh.read().await;
            rotated
                .iter()
                .filter(|(_, record)| record.retired_at + retention <= now)
                .take(cleanup::SWEEP_BATCH_LIMIT)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if !stale_rotated.is_empty() {
            let mut rotated = self.rotated_refresh.write().await;
            for key in &stale_rotated {
                if rotated
                    .get(key)
                    .is_some_and(|r| r.retired_at + retention <= now)
                {
                    rotated.remove(key);
                }
            }
        }

        let expired_bearers: Vec<String> = {
            let maps = self.tokens.read().await;
            maps.bearers
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .take(cleanup::SWEEP_BATCH_LIMIT)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if !expired_bearers.is_empty() {
            let mut maps = self.tokens.write().await;
            for key in &expired_bearers {
                if maps
                    .bearers
                    .get(key)
                    .is_some_and(|entry| entry.expires_at <= now)
                {
                    maps.bearers.remove(key);
                }
            }
        }
    }

    fn seal_token(&self, token: &UpstreamToken) -> Result<UpstreamToken, StoreError> {
        Ok(UpstreamToken {
            access_token: self.cipher.seal(&token.access_token)?,
            refresh_token: token
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.seal(t))
                .transpose()?,
            expires_at: token.expires_at,
        })
    }

    fn open_token(&self, token: &UpstreamToken) -> Result<UpstreamToken, StoreError> {
        Ok(UpstreamToken {
            access_token: self.cipher.open(&token.access_token)?,
            refresh_token: token
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.open(t))
                .transpose()?,
            expires_at: token.expires_at,
        })
    }
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore")
            .field("cipher", &self.cipher)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}
