//! Fan a single stream out to multiple consumers.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use datafusion::arrow::record_batch::RecordBatch;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::context::SendableBatchStream;
use crate::errors::FerryError;

/// Cursor shared by every view.
struct Shared<T> {
    /// Upstream. `None` once exhausted.
    source: Option<BoxStream<'static, T>>,
    /// Items not yet seen by every live view.
    buffer: VecDeque<T>,
    /// Absolute index of `buffer[0]`.
    base: usize,
    /// Absolute position of each live view.
    positions: HashMap<usize, usize>,
    next_view: usize,
    /// Views waiting for upstream to produce.
    parked: Vec<Waker>,
}

impl<T> Shared<T> {
    fn add_view(&mut self, position: usize) -> usize {
        let id = self.next_view;
        self.next_view += 1;
        self.positions.insert(id, position);
        id
    }

    /// Drop items every live view has moved past.
    fn release(&mut self) {
        let min = self
            .positions
            .values()
            .copied()
            .min()
            .unwrap_or(self.base + self.buffer.len());
        while self.base < min && !self.buffer.is_empty() {
            self.buffer.pop_front();
            self.base += 1;
        }
    }

    fn park(&mut self, waker: &Waker) {
        if !self.parked.iter().any(|w| w.will_wake(waker)) {
            self.parked.push(waker.clone());
        }
    }

    fn wake_parked(&mut self) {
        for waker in self.parked.drain(..) {
            waker.wake();
        }
    }
}

/// One consumer of a teed stream.
///
/// Views are independent and forward-only. Each observes every upstream item
/// in order, starting from the position it was created at.
pub struct TeeView<T> {
    id: usize,
    shared: Arc<Mutex<Shared<T>>>,
}

/// Split `source` into `n` views starting at the beginning.
pub fn tee<T>(source: BoxStream<'static, T>, n: usize) -> Vec<TeeView<T>>
where
    T: Clone + Send + 'static,
{
    let shared = Arc::new(Mutex::new(Shared {
        source: Some(source),
        buffer: VecDeque::new(),
        base: 0,
        positions: HashMap::new(),
        next_view: 0,
        parked: Vec::new(),
    }));

    (0..n)
        .map(|_| {
            let id = shared.lock().add_view(0);
            TeeView {
                id,
                shared: shared.clone(),
            }
        })
        .collect()
}

impl<T> TeeView<T> {
    /// Another view at this view's current position.
    pub fn fork(&self) -> TeeView<T> {
        let mut shared = self.shared.lock();
        let position = shared.positions.get(&self.id).copied().unwrap_or(shared.base);
        let id = shared.add_view(position);
        TeeView {
            id,
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> Stream for TeeView<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;

        let position = match shared.positions.get(&self.id) {
            Some(pos) => *pos,
            None => return Poll::Ready(None),
        };

        if position < shared.base + shared.buffer.len() {
            let item = shared.buffer[position - shared.base].clone();
            shared.positions.insert(self.id, position + 1);
            shared.release();
            return Poll::Ready(Some(item));
        }

        let source = match shared.source.as_mut() {
            Some(source) => source,
            None => return Poll::Ready(None),
        };

        match source.poll_next_unpin(cx) {
            Poll::Ready(Some(item)) => {
                shared.buffer.push_back(item.clone());
                shared.positions.insert(self.id, position + 1);
                shared.release();
                shared.wake_parked();
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                shared.source = None;
                shared.wake_parked();
                Poll::Ready(None)
            }
            Poll::Pending => {
                // Upstream only remembers the last waker it was polled with.
                // Whoever it wakes wakes everyone else.
                shared.park(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for TeeView<T> {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        shared.positions.remove(&self.id);
        shared.release();
        // Upstream may be holding this view's waker. Someone else has to poll
        // it now.
        shared.wake_parked();
    }
}

type SharedBatch = Result<RecordBatch, Arc<FerryError>>;

/// Tee a batch stream. Upstream errors are delivered to every view.
pub fn tee_batches(source: SendableBatchStream, n: usize) -> Vec<SendableBatchStream> {
    let source: BoxStream<'static, SharedBatch> =
        source.map(|r| r.map_err(FerryError::into_shared)).boxed();
    tee(source, n)
        .into_iter()
        .map(|view| view.map(|r| r.map_err(FerryError::Shared)).boxed())
        .collect()
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn views_see_every_item_in_order() {
        let source = stream::iter(0..10).boxed();
        let views = tee(source, 3);

        for view in views {
            let items: Vec<i32> = view.collect().await;
            assert_eq!((0..10).collect::<Vec<_>>(), items);
        }
    }

    #[tokio::test]
    async fn fork_starts_at_current_position() {
        let source = stream::iter(0..5).boxed();
        let mut views = tee(source, 1);
        let mut first = views.pop().unwrap();

        assert_eq!(Some(0), first.next().await);
        assert_eq!(Some(1), first.next().await);

        let forked = first.fork();
        let rest: Vec<i32> = first.collect().await;
        let forked_rest: Vec<i32> = forked.collect().await;

        assert_eq!(vec![2, 3, 4], rest);
        assert_eq!(vec![2, 3, 4], forked_rest);
    }

    #[tokio::test]
    async fn consumed_items_are_released() {
        let source = stream::iter(0..4).boxed();
        let mut views = tee(source, 2);
        let mut b = views.pop().unwrap();
        let mut a = views.pop().unwrap();

        a.next().await;
        a.next().await;
        assert_eq!(2, a.shared.lock().buffer.len());

        b.next().await;
        assert_eq!(1, a.shared.lock().buffer.len());

        drop(b);
        assert_eq!(0, a.shared.lock().buffer.len());
    }

    #[tokio::test]
    async fn dropping_a_view_wakes_the_others() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<i32>();
        let mut views = tee(rx.boxed(), 2);
        let mut b = views.pop().unwrap();
        let a = views.pop().unwrap();
        let shared = b.shared.clone();

        let waiting = tokio::spawn(async move {
            let mut a = a;
            a.next().await
        });
        while shared.lock().parked.is_empty() {
            tokio::task::yield_now().await;
        }

        // Upstream now only remembers b's waker.
        assert!(futures::poll!(b.next()).is_pending());
        drop(b);
        tx.unbounded_send(7).unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(7), got);
    }

    #[test]
    fn repeated_pending_polls_park_once() {
        let (_tx, rx) = futures::channel::mpsc::unbounded::<i32>();
        let mut views = tee(rx.boxed(), 1);
        let mut view = views.pop().unwrap();

        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        assert!(view.poll_next_unpin(&mut cx).is_pending());
        assert!(view.poll_next_unpin(&mut cx).is_pending());
        assert_eq!(1, view.shared.lock().parked.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers() {
        // Upstream yields between items so views race on the shared cursor.
        let source = stream::iter(0..500)
            .then(|i| async move {
                tokio::task::yield_now().await;
                i
            })
            .boxed();

        let handles: Vec<_> = tee(source, 8)
            .into_iter()
            .map(|view| tokio::spawn(async move { view.collect::<Vec<i32>>().await }))
            .collect();

        for handle in handles {
            let items = handle.await.unwrap();
            assert_eq!((0..500).collect::<Vec<_>>(), items);
        }
    }

    #[tokio::test]
    async fn errors_reach_every_view() {
        let source: SendableBatchStream =
            stream::iter(vec![Err(FerryError::TransportError("gone".to_string()))]).boxed();

        for mut view in tee_batches(source, 2) {
            let err = view.next().await.unwrap().unwrap_err();
            assert!(matches!(err.root(), FerryError::TransportError(_)));
        }
    }
}
