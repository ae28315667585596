//! Current-value-plus-subscribe cells that stores publish their state into.

use tokio::sync::watch;

/// Holds the latest published value of some view. Readers either take a
/// snapshot with [`Observable::get`] or [`Observable::subscribe`] to be woken
/// on every publish.
#[derive(Debug)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

/// Receiving side of an [`Observable`].
pub type Subscription<T> = watch::Receiver<T>;

impl<T: Clone> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and wake subscribers. Never fails, even with no
    /// subscribers attached.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
    }

    pub fn subscribe(&self) -> Subscription<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let cell = Observable::new(1u32);
        cell.publish(2);
        assert_eq!(cell.get(), 2);
    }

    #[tokio::test]
    async fn test_subscriber_sees_updates() {
        let cell = Observable::new(Vec::<String>::new());
        let mut sub = cell.subscribe();
        cell.publish(vec!["a".to_string()]);
        sub.changed().await.unwrap();
        assert_eq!(*sub.borrow_and_update(), vec!["a".to_string()]);
    }
}
