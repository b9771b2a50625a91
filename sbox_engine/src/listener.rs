/// Engine notifications for an editor or host. All methods default to no-ops.
///
/// `playhead_moved` is called from the audio thread once per processed block,
/// so implementations must not block or allocate there.
pub trait EngineListener: Send {
    fn voice_changed(&mut self, _voice: usize) {}
    fn playhead_moved(&mut self, _beat: f64) {}
    fn pattern_changed(&mut self, _voice: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerSet {
    next_id: u64,
    listeners: Vec<(ListenerId, Box<dyn EngineListener>)>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Box<dyn EngineListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        before != self.listeners.len()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn voice_changed(&mut self, voice: usize) {
        for (_, listener) in &mut self.listeners {
            listener.voice_changed(voice);
        }
    }

    pub fn playhead_moved(&mut self, beat: f64) {
        for (_, listener) in &mut self.listeners {
            listener.playhead_moved(beat);
        }
    }

    pub fn pattern_changed(&mut self, voice: usize) {
        for (_, listener) in &mut self.listeners {
            listener.pattern_changed(voice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Log(Arc<Mutex<Vec<String>>>, &'static str);

    impl EngineListener for Log {
        fn voice_changed(&mut self, voice: usize) {
            self.0.lock().unwrap().push(format!("{} voice {}", self.1, voice));
        }
        fn pattern_changed(&mut self, voice: usize) {
            self.0.lock().unwrap().push(format!("{} pattern {}", self.1, voice));
        }
    }

    #[test]
    fn test_add_notify_remove() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ListenerSet::new();
        let a = set.add(Box::new(Log(log.clone(), "a")));
        let b = set.add(Box::new(Log(log.clone(), "b")));
        assert_ne!(a, b);

        set.voice_changed(2);
        assert!(set.remove(a));
        assert!(!set.remove(a));
        set.pattern_changed(1);
        set.playhead_moved(1.0);

        assert_eq!(*log.lock().unwrap(), vec!["a voice 2", "b voice 2", "b pattern 1"]);
        set.clear();
        assert!(set.is_empty());
    }
}
