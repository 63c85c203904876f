use std::collections::{HashMap, VecDeque};

/// One anchor position of a track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    pub x: f32,
    pub y: f32,
    pub frame_index: u64,
}

impl TrajectoryPoint {
    pub fn new(x: f32, y: f32, frame_index: u64) -> Self {
        Self { x, y, frame_index }
    }
}

/// Fixed-capacity FIFO of anchor points, oldest first.
#[derive(Debug, Clone)]
pub struct Window {
    points: VecDeque<TrajectoryPoint>,
    capacity: usize,
}

impl Window {
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `point`, returning the evicted oldest point when full.
    #[inline]
    pub fn push(&mut self, point: TrajectoryPoint) -> Option<TrajectoryPoint> {
        let evicted = if self.is_full() {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(point);
        evicted
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.points.len() == self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn latest(&self) -> Option<&TrajectoryPoint> {
        self.points.back()
    }

    #[inline]
    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, TrajectoryPoint> {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<TrajectoryPoint> {
        self.points.iter().copied().collect()
    }
}

/// Per-track bounded history of recent anchor positions.
///
/// Windows are never removed; a track that stops being reported simply
/// keeps its last `capacity` points.
#[derive(Debug)]
pub struct TrajectoryStore {
    windows: HashMap<u32, Window>,
    capacity: usize,
}

impl TrajectoryStore {
    /// `capacity` is the source frame rate, giving a ~1 second window.
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, track_id: u32, point: (f32, f32), frame_index: u64) -> &Window {
        let capacity = self.capacity;
        let window = self
            .windows
            .entry(track_id)
            .or_insert_with(|| Window::with_capacity(capacity));
        window.push(TrajectoryPoint::new(point.0, point.1, frame_index));
        window
    }

    pub fn window(&self, track_id: u32) -> Option<&Window> {
        self.windows.get(&track_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn track_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut store = TrajectoryStore::new(30);
        for i in 0..100u64 {
            let window = store.record(1, (i as f32, 0.0), i);
            assert!(window.len() <= 30);
        }
        assert_eq!(store.window(1).unwrap().len(), 30);
    }

    #[test]
    fn test_oldest_point_evicted_first() {
        let mut store = TrajectoryStore::new(3);
        for i in 0..5u64 {
            store.record(9, (i as f32 * 10.0, 5.0), i);
        }
        let frames: Vec<u64> = store.window(9).unwrap().iter().map(|p| p.frame_index).collect();
        assert_eq!(frames, vec![2, 3, 4]);
        assert_eq!(store.window(9).unwrap().latest().unwrap().x, 40.0);
    }

    #[test]
    fn test_tracks_are_independent() {
        let mut store = TrajectoryStore::new(4);
        store.record(1, (0.0, 0.0), 0);
        store.record(2, (5.0, 5.0), 0);
        store.record(1, (1.0, 0.0), 1);

        assert_eq!(store.track_count(), 2);
        assert_eq!(store.window(1).unwrap().len(), 2);
        assert_eq!(store.window(2).unwrap().len(), 1);
        assert!(store.window(3).is_none());
    }

    #[test]
    fn test_push_reports_eviction() {
        let mut window = Window::with_capacity(2);
        assert!(window.push(TrajectoryPoint::new(0.0, 0.0, 0)).is_none());
        assert!(window.push(TrajectoryPoint::new(1.0, 0.0, 1)).is_none());
        let evicted = window.push(TrajectoryPoint::new(2.0, 0.0, 2)).unwrap();
        assert_eq!(evicted.frame_index, 0);
        assert!(window.is_full());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let store = TrajectoryStore::new(0);
        assert_eq!(store.capacity(), 1);
    }
}
