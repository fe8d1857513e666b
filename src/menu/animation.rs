use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::menu::layout::Point;
use crate::menu::node::NodeId;
use crate::menu::state::{ChildMove, MenuEvent};

struct Tween {
    from: Point,
    to: Point,
    start: Instant,
}

/// Turns move events into timed tweens and reports finished transitions.
pub struct Animator {
    duration: Duration,
    tweens: HashMap<NodeId, Tween>,
    deadlines: HashMap<NodeId, Instant>,
}

impl Animator {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            tweens: HashMap::new(),
            deadlines: HashMap::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_running(&self) -> bool {
        !self.deadlines.is_empty()
    }

    /// Events other than moves are ignored.
    pub fn apply(&mut self, event: &MenuEvent, now: Instant) {
        match event {
            MenuEvent::Expanding { node, moves } | MenuEvent::Collapsing { node, moves } => {
                self.start(*node, moves, now);
            }
            _ => {}
        }
    }

    fn start(&mut self, node: NodeId, moves: &[ChildMove], now: Instant) {
        for m in moves {
            // A child reversing mid-flight starts from where it is drawn now.
            let from = self.current_position(m.child, now).unwrap_or(m.from);
            self.tweens.insert(
                m.child,
                Tween {
                    from,
                    to: m.to,
                    start: now,
                },
            );
        }
        debug!("Animating {} child(ren) of {}", moves.len(), node);
        self.deadlines.insert(node, now + self.duration);
    }

    /// Nodes whose transition completed at `now`; feed them to `MenuStateMachine::finish`.
    pub fn tick(&mut self, now: Instant) -> Vec<NodeId> {
        let duration = self.duration;
        self.tweens
            .retain(|_, tween| now.saturating_duration_since(tween.start) < duration);

        let mut done: Vec<NodeId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(node, _)| *node)
            .collect();
        done.sort();
        for node in &done {
            self.deadlines.remove(node);
        }
        done
    }

    /// Interpolated top-left position of a child that is currently moving.
    pub fn current_position(&self, child: NodeId, now: Instant) -> Option<Point> {
        let tween = self.tweens.get(&child)?;
        if self.duration.is_zero() {
            return Some(tween.to);
        }
        let elapsed = now.saturating_duration_since(tween.start).as_secs_f64();
        let t = (elapsed / self.duration.as_secs_f64()).clamp(0.0, 1.0);
        Some(tween.from.lerp(tween.to, ease_out_bounce(t)))
    }
}

fn ease_out_bounce(t: f64) -> f64 {
    const N1: f64 = 7.5625;
    const D1: f64 = 2.75;
    if t < 1.0 / D1 {
        N1 * t * t
    } else if t < 2.0 / D1 {
        let t = t - 1.5 / D1;
        N1 * t * t + 0.75
    } else if t < 2.5 / D1 {
        let t = t - 2.25 / D1;
        N1 * t * t + 0.9375
    } else {
        let t = t - 2.625 / D1;
        N1 * t * t + 0.984375
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expanding(node: usize, child: usize) -> MenuEvent {
        MenuEvent::Expanding {
            node: NodeId(node),
            moves: vec![ChildMove {
                child: NodeId(child),
                from: Point::new(0.0, 0.0),
                to: Point::new(100.0, 0.0),
            }],
        }
    }

    #[test]
    fn test_easing_endpoints() {
        assert_eq!(ease_out_bounce(0.0), 0.0);
        assert!((ease_out_bounce(1.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tween_starts_at_origin_and_finishes_at_target() {
        let mut animator = Animator::new(Duration::from_millis(500));
        let start = Instant::now();
        animator.apply(&expanding(0, 1), start);

        assert_eq!(animator.current_position(NodeId(1), start), Some(Point::new(0.0, 0.0)));
        let mid = animator
            .current_position(NodeId(1), start + Duration::from_millis(250))
            .unwrap();
        assert!(mid.x > 0.0 && mid.x <= 100.0);

        assert!(animator.tick(start + Duration::from_millis(100)).is_empty());
        assert!(animator.is_running());
        assert_eq!(animator.tick(start + Duration::from_millis(500)), vec![NodeId(0)]);
        assert!(!animator.is_running());
        assert_eq!(animator.current_position(NodeId(1), start + Duration::from_millis(500)), None);
    }

    #[test]
    fn test_zero_duration_finishes_on_first_tick() {
        let mut animator = Animator::new(Duration::ZERO);
        let now = Instant::now();
        animator.apply(&expanding(2, 3), now);
        assert_eq!(animator.tick(now), vec![NodeId(2)]);
    }

    #[test]
    fn test_reversal_starts_from_current_position() {
        let mut animator = Animator::new(Duration::from_millis(400));
        let start = Instant::now();
        animator.apply(&expanding(0, 1), start);
        let halfway = start + Duration::from_millis(200);
        let drawn = animator.current_position(NodeId(1), halfway).unwrap();

        animator.apply(
            &MenuEvent::Collapsing {
                node: NodeId(0),
                moves: vec![ChildMove {
                    child: NodeId(1),
                    from: Point::new(100.0, 0.0),
                    to: Point::new(0.0, 0.0),
                }],
            },
            halfway,
        );
        assert_eq!(animator.current_position(NodeId(1), halfway), Some(drawn));
    }

    #[test]
    fn test_non_move_events_are_ignored() {
        let mut animator = Animator::new(Duration::from_millis(10));
        animator.apply(&MenuEvent::Expanded(NodeId(0)), Instant::now());
        assert!(!animator.is_running());
    }
}
