// Typing presence for huddle
// Local side: debounce keystrokes into isTyping=true/false announcements.
// Remote side: who is typing in each conversation, with expiry so a peer
// that vanished mid-sentence does not stay "typing" forever.

use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::connection::Outbound;
use super::protocol::{Envelope, Event};
use super::SessionEvent;

#[derive(Debug, Default)]
struct LocalTyping {
    typing: bool,
    /// When isTyping=true last went out
    announced_at: Option<Instant>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl LocalTyping {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct TypingState {
    local: HashMap<String, LocalTyping>,
    /// room -> display name -> expiry
    remote: HashMap<String, HashMap<String, Instant>>,
}

#[derive(Clone)]
pub struct TypingCoordinator {
    local_name: String,
    idle_window: Duration,
    remote_ttl: Duration,
    outbound: Arc<dyn Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<Mutex<TypingState>>,
}

impl TypingCoordinator {
    pub fn new(
        local_name: impl Into<String>,
        idle_window: Duration,
        remote_ttl: Duration,
        outbound: Arc<dyn Outbound>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            idle_window,
            remote_ttl,
            outbound,
            events,
            state: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    /// Feed the current composer contents for a conversation
    pub async fn input_changed(&self, room_id: &str, text: &str) {
        let mut state = self.state.lock().await;
        let entry = state.local.entry(room_id.to_string()).or_default();

        if text.trim().is_empty() {
            if entry.typing {
                entry.typing = false;
                entry.announced_at = None;
                entry.cancel_timer();
                self.announce(room_id, false);
            }
            return;
        }

        // Peers expire us after their TTL, so a long burst has to be re-announced
        let now = Instant::now();
        let due = entry
            .announced_at
            .map_or(true, |last| now.duration_since(last) >= self.refresh_every());
        if !entry.typing || due {
            entry.typing = true;
            entry.announced_at = Some(now);
            self.announce(room_id, true);
        }

        entry.generation += 1;
        entry.cancel_timer();
        let generation = entry.generation;
        let this = self.clone();
        let room = room_id.to_string();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(this.idle_window).await;
            this.idle_elapsed(&room, generation).await;
        }));
    }

    fn refresh_every(&self) -> Duration {
        self.idle_window.min(self.remote_ttl / 2)
    }

    async fn idle_elapsed(&self, room_id: &str, generation: u64) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.local.get_mut(room_id) {
            if entry.generation == generation && entry.typing {
                entry.typing = false;
                entry.announced_at = None;
                entry.timer = None;
                debug!("Typing idle window elapsed in {}", room_id);
                self.announce(room_id, false);
            }
        }
    }

    /// Called when a message goes out: whatever was being typed is done
    pub async fn stop_typing(&self, room_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.local.get_mut(room_id) {
            if entry.typing {
                entry.typing = false;
                entry.announced_at = None;
                entry.cancel_timer();
                self.announce(room_id, false);
            }
        }
    }

    pub async fn is_typing_locally(&self, room_id: &str) -> bool {
        let state = self.state.lock().await;
        state.local.get(room_id).map_or(false, |entry| entry.typing)
    }

    fn announce(&self, room_id: &str, is_typing: bool) {
        let envelope = Envelope::new(
            room_id,
            Event::Typing { user_name: self.local_name.clone(), is_typing },
        );
        // Fire and forget: a lost typing hint is not worth surfacing
        match self.outbound.send(envelope) {
            Ok(()) => debug!("Sent isTyping={} for {}", is_typing, room_id),
            Err(e) => debug!("Failed to send typing state: {}", e),
        }
    }

    /// Apply an inbound `typing` event
    pub async fn handle_remote(&self, room_id: &str, user_name: &str, is_typing: bool, now: Instant) {
        if user_name == self.local_name {
            return;
        }
        let mut state = self.state.lock().await;
        let before = visible(state.remote.get(room_id), now);
        let room = state.remote.entry(room_id.to_string()).or_default();
        if is_typing {
            room.insert(user_name.to_string(), now + self.remote_ttl);
        } else {
            room.remove(user_name);
        }
        let after = visible(state.remote.get(room_id), now);
        if before != after {
            self.publish(room_id, after);
        }
    }

    /// A chat message from `user_name` means they stopped typing
    pub async fn clear_sender(&self, room_id: &str, user_name: &str) {
        let mut state = self.state.lock().await;
        let removed = state
            .remote
            .get_mut(room_id)
            .map_or(false, |room| room.remove(user_name).is_some());
        if removed {
            let users = visible(state.remote.get(room_id), Instant::now());
            self.publish(room_id, users);
        }
    }

    /// Drop expired remote entries
    pub async fn sweep(&self, now: Instant) {
        let mut state = self.state.lock().await;
        let mut changed = Vec::new();
        for (room_id, users) in state.remote.iter_mut() {
            let before = users.len();
            users.retain(|_, expiry| *expiry > now);
            if users.len() != before {
                changed.push(room_id.clone());
            }
        }
        state.remote.retain(|_, users| !users.is_empty());
        for room_id in changed {
            let users = visible(state.remote.get(&room_id), now);
            self.publish(&room_id, users);
        }
    }

    /// Forget every remote indicator, e.g. after the connection dropped
    pub async fn clear_remote(&self) {
        let mut state = self.state.lock().await;
        let rooms: Vec<String> = state
            .remote
            .iter()
            .filter(|(_, users)| !users.is_empty())
            .map(|(room, _)| room.clone())
            .collect();
        state.remote.clear();
        for room_id in rooms {
            self.publish(&room_id, Vec::new());
        }
    }

    pub async fn typing_users(&self, room_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        visible(state.remote.get(room_id), Instant::now())
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for entry in state.local.values_mut() {
            entry.cancel_timer();
        }
        state.local.clear();
        state.remote.clear();
    }

    fn publish(&self, room_id: &str, users: Vec<String>) {
        let _ = self.events.send(SessionEvent::TypingChanged {
            room_id: room_id.to_string(),
            users,
        });
    }
}

fn visible(users: Option<&HashMap<String, Instant>>, now: Instant) -> Vec<String> {
    users
        .map(|users| {
            users
                .iter()
                .filter(|(_, expiry)| **expiry > now)
                .map(|(name, _)| name.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        coordinator: TypingCoordinator,
        sent: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn harness() -> Harness {
        let (out_tx, sent) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let coordinator = TypingCoordinator::new(
            "Alice",
            Duration::from_secs(2),
            Duration::from_secs(3),
            Arc::new(out_tx),
            event_tx,
        );
        Harness { coordinator, sent, events }
    }

    fn typing_flags(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<bool> {
        let mut flags = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let Event::Typing { is_typing, .. } = envelope.event {
                flags.push(is_typing);
            }
        }
        flags
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_debounce_into_one_announcement() {
        let mut h = harness();
        h.coordinator.input_changed("room1", "h").await;
        h.coordinator.input_changed("room1", "he").await;
        h.coordinator.input_changed("room1", "hel").await;
        assert_eq!(typing_flags(&mut h.sent), vec![true]);
        assert!(h.coordinator.is_typing_locally("room1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_burst_is_reannounced_before_peers_expire_it() {
        let mut h = harness();
        // 2 s idle window, 3 s remote TTL: refresh every 1.5 s
        for i in 0..20 {
            h.coordinator.input_changed("room1", &"x".repeat(i + 1)).await;
            tokio::time::advance(Duration::from_millis(250)).await;
        }
        let flags = typing_flags(&mut h.sent);
        assert!(flags.iter().all(|&typing| typing));
        // t = 0, 1.5, 3.0, 4.5
        assert_eq!(flags.len(), 4);
        assert!(h.coordinator.is_typing_locally("room1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_keeps_a_long_typer_visible() {
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<Envelope>();
        let (alice_events, _alice_rx) = mpsc::unbounded_channel();
        let alice = TypingCoordinator::new(
            "Alice",
            Duration::from_secs(2),
            Duration::from_secs(3),
            Arc::new(relay_tx),
            alice_events,
        );
        let (bob_out, _bob_sent) = mpsc::unbounded_channel();
        let (bob_events, _bob_rx) = mpsc::unbounded_channel();
        let bob = TypingCoordinator::new(
            "Bob",
            Duration::from_secs(2),
            Duration::from_secs(3),
            Arc::new(bob_out),
            bob_events,
        );

        for i in 0..24 {
            alice.input_changed("room1", &"y".repeat(i + 1)).await;
            while let Ok(envelope) = relay_rx.try_recv() {
                if let Event::Typing { user_name, is_typing } = envelope.event {
                    bob.handle_remote("room1", &user_name, is_typing, Instant::now()).await;
                }
            }
            tokio::time::advance(Duration::from_millis(200)).await;
            bob.sweep(Instant::now()).await;
            assert_eq!(bob.typing_users("room1").await, vec!["Alice"], "after {} keystrokes", i + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_window_announces_stop() {
        let mut h = harness();
        h.coordinator.input_changed("room1", "h").await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        // another keystroke restarts the window
        h.coordinator.input_changed("room1", "hi").await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        // the second keystroke landed on the refresh boundary
        assert_eq!(typing_flags(&mut h.sent), vec![true, true]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(typing_flags(&mut h.sent), vec![false]);
        assert!(!h.coordinator.is_typing_locally("room1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_input_stops_immediately() {
        let mut h = harness();
        h.coordinator.input_changed("room1", "draft").await;
        h.coordinator.input_changed("room1", "").await;
        assert_eq!(typing_flags(&mut h.sent), vec![true, false]);

        // the cancelled timer must not fire a second false
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(typing_flags(&mut h.sent).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_typing_after_send() {
        let mut h = harness();
        h.coordinator.input_changed("room1", "hello").await;
        h.coordinator.stop_typing("room1").await;
        h.coordinator.stop_typing("room1").await;
        assert_eq!(typing_flags(&mut h.sent), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_typing_set() {
        let mut h = harness();
        let now = Instant::now();
        h.coordinator.handle_remote("room1", "Bob", true, now).await;
        h.coordinator.handle_remote("room1", "Carol", true, now).await;
        assert_eq!(h.coordinator.typing_users("room1").await, vec!["Bob", "Carol"]);

        h.coordinator.handle_remote("room1", "Bob", false, now).await;
        assert_eq!(h.coordinator.typing_users("room1").await, vec!["Carol"]);

        h.coordinator.clear_sender("room1", "Carol").await;
        assert!(h.coordinator.typing_users("room1").await.is_empty());

        let mut last = None;
        while let Ok(event) = h.events.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(SessionEvent::TypingChanged { room_id: "room1".to_string(), users: vec![] })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_typing_echo_is_ignored() {
        let h = harness();
        h.coordinator.handle_remote("room1", "Alice", true, Instant::now()).await;
        assert!(h.coordinator.typing_users("room1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_entries_expire_without_explicit_stop() {
        let h = harness();
        h.coordinator.handle_remote("room1", "Bob", true, Instant::now()).await;

        tokio::time::advance(Duration::from_millis(2_900)).await;
        h.coordinator.sweep(Instant::now()).await;
        assert_eq!(h.coordinator.typing_users("room1").await, vec!["Bob"]);

        tokio::time::advance(Duration::from_millis(200)).await;
        // even before a sweep, expired entries are hidden
        assert!(h.coordinator.typing_users("room1").await.is_empty());
        h.coordinator.sweep(Instant::now()).await;
        assert!(h.coordinator.typing_users("room1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_expiry() {
        let h = harness();
        h.coordinator.handle_remote("room1", "Bob", true, Instant::now()).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        h.coordinator.handle_remote("room1", "Bob", true, Instant::now()).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        h.coordinator.sweep(Instant::now()).await;
        assert_eq!(h.coordinator.typing_users("room1").await, vec!["Bob"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_remote_on_disconnect() {
        let mut h = harness();
        h.coordinator.handle_remote("room1", "Bob", true, Instant::now()).await;
        h.coordinator.handle_remote("room2", "Dan", true, Instant::now()).await;
        while h.events.try_recv().is_ok() {}

        h.coordinator.clear_remote().await;
        assert!(h.coordinator.typing_users("room1").await.is_empty());
        assert!(h.coordinator.typing_users("room2").await.is_empty());

        let mut cleared = 0;
        while let Ok(SessionEvent::TypingChanged { users, .. }) = h.events.try_recv() {
            assert!(users.is_empty());
            cleared += 1;
        }
        assert_eq!(cleared, 2);
    }
}
