//! Client-side rendezvous flow: decides what to register with the
//! coordinator and what to do with the events it sends back
//! (`spec.md` §4.4).
//!
//! This is a pure effects-producing state machine: it has no socket of its
//! own. Callers drive it with [`RendezvousEngine::tick`] and
//! [`RendezvousEngine::on_dead_drop`]/[`RendezvousEngine::on_live_match`],
//! and are responsible for actually sending the returned
//! [`RendezvousEffect`]s over a signaling connection.

use std::collections::HashMap;

use crate::pairing_code::PairingCode;
use crate::{open_dead_drop, seal_dead_drop, MeetingPoint, Result, SealedDeadDrop};
use zajel_crypto::x25519::X25519StaticSecret;

/// Per-watched-peer bookkeeping: which cadence windows we've already
/// registered, so `tick` only emits effects for windows that changed.
#[derive(Clone, Debug, Default)]
struct WatchState {
    registered_days: Vec<u64>,
    registered_hour: Option<u64>,
}

/// Something the caller must do as a result of driving the engine: publish
/// a registration to the coordinator, or act on a resolved rendezvous.
#[derive(Clone, Debug)]
pub enum RendezvousEffect {
    /// Register a daily meeting point, with its sealed dead drop, at the
    /// coordinator.
    RegisterDaily {
        peer_pk: [u8; 32],
        meeting_point: [u8; 32],
        dead_drop: SealedDeadDrop,
    },
    /// Register an hourly live-match token at the coordinator.
    RegisterHourly { peer_pk: [u8; 32], meeting_point: [u8; 32] },
    /// A dead drop or live match resolved to a peer we should now attempt
    /// to pair with, possibly on a different coordinator.
    PairRequest {
        code: PairingCode,
        via_server: Option<String>,
    },
}

/// Drives daily/hourly meeting-point registration for the set of peers we
/// want to be reachable by, and reacts to dead drops / live matches the
/// coordinator forwards.
pub struct RendezvousEngine {
    self_pk: [u8; 32],
    self_secret: X25519StaticSecret,
    current_code: PairingCode,
    watched: HashMap<[u8; 32], WatchState>,
}

impl RendezvousEngine {
    pub fn new(self_pk: [u8; 32], self_secret: X25519StaticSecret, current_code: PairingCode) -> Self {
        Self {
            self_pk,
            self_secret,
            current_code,
            watched: HashMap::new(),
        }
    }

    /// Start publishing meeting points for `peer_pk` on the next `tick`.
    pub fn watch_peer(&mut self, peer_pk: [u8; 32]) {
        self.watched.entry(peer_pk).or_default();
    }

    /// Stop publishing meeting points for a peer (e.g. on removal or
    /// blocking).
    pub fn unwatch_peer(&mut self, peer_pk: &[u8; 32]) {
        self.watched.remove(peer_pk);
    }

    /// Our own pairing code changed (it is single-registration, per
    /// `spec.md` §3); subsequent dead drops will advertise the new one.
    pub fn set_current_code(&mut self, code: PairingCode) {
        self.current_code = code;
    }

    /// Called on connect and on every hourly boundary. Produces one
    /// `RegisterDaily` effect per watched peer per day in the 3-day
    /// tolerance window that hasn't already been registered this run, and
    /// one `RegisterHourly` effect per watched peer whose hour changed.
    pub fn tick(&mut self, now: u64, signaling_hint: Option<&str>) -> Result<Vec<RendezvousEffect>> {
        let mut effects = Vec::new();
        let hour = MeetingPoint::hour_index(now);

        for (peer_pk, state) in self.watched.iter_mut() {
            let days = daily_window_indices(now);
            for day in &days {
                if state.registered_days.contains(day) {
                    continue;
                }
                let point = MeetingPoint::daily_point(&self.self_pk, peer_pk, *day);
                let dead_drop = seal_dead_drop(
                    peer_pk,
                    &self.self_pk,
                    self.current_code.as_str().to_string(),
                    signaling_hint.map(str::to_string),
                    now,
                )?;
                effects.push(RendezvousEffect::RegisterDaily {
                    peer_pk: *peer_pk,
                    meeting_point: point,
                    dead_drop,
                });
            }
            state.registered_days = days;

            if state.registered_hour != Some(hour) {
                let point = MeetingPoint::hourly_token(&self.self_pk, peer_pk, hour);
                effects.push(RendezvousEffect::RegisterHourly {
                    peer_pk: *peer_pk,
                    meeting_point: point,
                });
                state.registered_hour = Some(hour);
            }
        }

        Ok(effects)
    }

    /// A `rendezvous_deaddrop` message arrived from the coordinator.
    /// Attempts to open it; a failure to open is a silent drop (`spec.md`
    /// §4.4) — returns `None`, not an error.
    pub fn on_dead_drop(&self, drop: &SealedDeadDrop) -> Option<RendezvousEffect> {
        let payload = open_dead_drop(drop, &self.self_secret).ok()?;
        let code = PairingCode::parse(&payload.sender_pairing_code).ok()?;
        Some(RendezvousEffect::PairRequest {
            code,
            via_server: payload.signaling_hint,
        })
    }

    /// A `rendezvous_live_match` message arrived, carrying the peer's
    /// current pairing code. The side with the lexicographically higher
    /// code initiates (`spec.md` §4.4).
    pub fn on_live_match(&self, peer_code: &PairingCode) -> Option<RendezvousEffect> {
        if self.current_code > *peer_code {
            Some(RendezvousEffect::PairRequest {
                code: peer_code.clone(),
                via_server: None,
            })
        } else {
            None
        }
    }
}

fn daily_window_indices(now: u64) -> Vec<u64> {
    let today = MeetingPoint::day_index(now) as i64;
    ((today - crate::DAILY_TOLERANCE_DAYS)..=(today + crate::DAILY_TOLERANCE_DAYS))
        .filter(|&day| day >= 0)
        .map(|day| day as u64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zajel_crypto::x25519::X25519StaticSecret;

    fn engine() -> (RendezvousEngine, [u8; 32]) {
        let self_secret = X25519StaticSecret::random();
        let self_pk = self_secret.public_key().to_bytes();
        let code = PairingCode::parse("A2B3C4").expect("valid");
        (RendezvousEngine::new(self_pk, self_secret, code), self_pk)
    }

    #[test]
    fn first_tick_registers_three_days_and_one_hour() {
        let (mut engine, _) = engine();
        let peer_pk = [0x42u8; 32];
        engine.watch_peer(peer_pk);

        let now = 10 * crate::SECONDS_PER_DAY + 100;
        let effects = engine.tick(now, Some("wss://example")).expect("tick");

        let daily = effects.iter().filter(|e| matches!(e, RendezvousEffect::RegisterDaily { .. })).count();
        let hourly = effects.iter().filter(|e| matches!(e, RendezvousEffect::RegisterHourly { .. })).count();
        assert_eq!(daily, 3);
        assert_eq!(hourly, 1);
    }

    #[test]
    fn second_tick_same_hour_is_idempotent() {
        let (mut engine, _) = engine();
        let peer_pk = [0x42u8; 32];
        engine.watch_peer(peer_pk);

        let now = 10 * crate::SECONDS_PER_DAY + 100;
        engine.tick(now, None).expect("first tick");
        let effects = engine.tick(now + 1, None).expect("second tick");
        assert!(effects.is_empty());
    }

    #[test]
    fn tick_after_hour_boundary_emits_new_hourly() {
        let (mut engine, _) = engine();
        let peer_pk = [0x42u8; 32];
        engine.watch_peer(peer_pk);

        let now = 10 * crate::SECONDS_PER_DAY;
        engine.tick(now, None).expect("first tick");
        let effects = engine.tick(now + crate::SECONDS_PER_HOUR, None).expect("later tick");
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], RendezvousEffect::RegisterHourly { .. }));
    }

    #[test]
    fn dead_drop_opens_to_pair_request() {
        let (engine, self_pk) = engine();
        let sender_secret = X25519StaticSecret::random();
        let sender_pk = sender_secret.public_key().to_bytes();

        let drop = crate::seal_dead_drop(&self_pk, &sender_pk, "Z9Y8X7".to_string(), Some("wss://peer".into()), 1_000)
            .expect("seal");

        let effect = engine.on_dead_drop(&drop).expect("opens");
        match effect {
            RendezvousEffect::PairRequest { code, via_server } => {
                assert_eq!(code.as_str(), "Z9Y8X7");
                assert_eq!(via_server.as_deref(), Some("wss://peer"));
            }
            _ => panic!("expected PairRequest"),
        }
    }

    #[test]
    fn dead_drop_from_wrong_recipient_is_silent_drop() {
        let (_, self_pk) = engine();
        let other_secret = X25519StaticSecret::random();
        let wrong_engine = RendezvousEngine::new(
            other_secret.public_key().to_bytes(),
            other_secret,
            PairingCode::parse("B2B2B2").expect("valid"),
        );

        let sender_secret = X25519StaticSecret::random();
        let sender_pk = sender_secret.public_key().to_bytes();
        let drop = crate::seal_dead_drop(&self_pk, &sender_pk, "Z9Y8X7".to_string(), None, 1_000).expect("seal");

        assert!(wrong_engine.on_dead_drop(&drop).is_none());
    }

    #[test]
    fn live_match_higher_code_initiates() {
        let (engine, _) = engine(); // current code A2B3C4
        let lower = PairingCode::parse("A1A1A1").expect("valid");
        let higher = PairingCode::parse("Z9Z9Z9").expect("valid");

        assert!(engine.on_live_match(&lower).is_some());
        assert!(engine.on_live_match(&higher).is_none());
    }
}
