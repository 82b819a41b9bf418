//! Short-lived messages for the player. Drawing them is up to whatever overlay is attached.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Level {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug)]
pub struct Notice {
    pub level: Level,
    pub text: String,
    posted: Instant,
}

/// Only the newest notices are kept.
const MAX_NOTICES: usize = 32;

pub struct Notices {
    queue: Mutex<VecDeque<Notice>>,
    lifetime: Duration,
}

impl Notices {
    pub fn new(lifetime: Duration) -> Notices {
        Notices {
            queue: Mutex::new(VecDeque::new()),
            lifetime,
        }
    }

    /// Posts a notice and writes it to the log.
    pub fn post(&self, level: Level, text: impl Into<String>) {
        let text = text.into();

        match level {
            Level::Info => log::info!("{}", text),
            Level::Warning => log::warn!("{}", text),
            Level::Error => log::error!("{}", text),
        }

        if let Ok(mut queue) = self.queue.lock() {
            if queue.len() == MAX_NOTICES {
                queue.pop_front();
            }

            queue.push_back(Notice {
                level,
                text,
                posted: Instant::now(),
            });
        }
    }

    /// Returns the notices that haven't expired, oldest first.
    pub fn current(&self) -> Vec<Notice> {
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(_) => return vec![],
        };

        let lifetime = self.lifetime;
        queue.retain(|notice| notice.posted.elapsed() < lifetime);

        queue.iter().cloned().collect()
    }

    pub fn clear(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_expire() {
        let notices = Notices::new(Duration::from_millis(50));
        notices.post(Level::Error, "failed to compile");

        let current = notices.current();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].level, Level::Error);

        std::thread::sleep(Duration::from_millis(80));
        assert!(notices.current().is_empty());
    }

    #[test]
    fn keeps_newest() {
        let notices = Notices::new(Duration::from_secs(60));

        for i in 0..MAX_NOTICES + 5 {
            notices.post(Level::Info, format!("notice {}", i));
        }

        let current = notices.current();
        assert_eq!(current.len(), MAX_NOTICES);
        assert_eq!(current[0].text, "notice 5");

        notices.clear();
        assert!(notices.current().is_empty());
    }
}
