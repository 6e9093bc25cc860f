// ===============================
// src/book.rs
// ===============================
//
// Order book mirror fed by REST snapshots + WS incremental diffs.
//
// - Entries are keyed by an exchange-assigned entry id (Bitmex orderBookL2
//   ids; for price-keyed feeds the adapter derives a synthetic id).
// - Each side keeps a price-sorted Vec (bids descending, asks ascending)
//   plus an id -> price index so diffs resolve in O(1) + short scan.
// - Writers apply diffs inside an update bracket that holds both side
//   locks, so readers never observe a half-applied snapshot.
// - A diff referencing an unknown id marks the book dirty instead of
//   panicking; the owner is expected to request a fresh snapshot.

use ahash::AHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Incremental operation kinds as exchanges report them.
/// `RefreshAll` entries are the per-row form of a full snapshot; callers
/// `clear()` once and then feed every row with this kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookOp {
    Add,
    Modify,
    Remove,
    RefreshAll,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookEntry {
    pub id: u64,
    pub price: f64,
    pub amount: f64,
}

/// One side of the book. `mirror`, when present, is the exact reverse of
/// `entries` and is maintained in the same critical section (inverted-ask
/// rendering for contract markets).
#[derive(Debug)]
struct SideLevels {
    entries: Vec<BookEntry>,
    index: AHashMap<u64, f64>,
    descending: bool,
    mirror: Option<Vec<BookEntry>>,
}

impl SideLevels {
    fn new(descending: bool, mirrored: bool) -> Self {
        Self {
            entries: Vec::new(),
            index: AHashMap::new(),
            descending,
            mirror: if mirrored { Some(Vec::new()) } else { None },
        }
    }

    /// First index at which `price` belongs; also the start of the run of
    /// entries carrying exactly that price.
    fn position_for(&self, price: f64) -> usize {
        if self.descending {
            self.entries.partition_point(|e| e.price > price)
        } else {
            self.entries.partition_point(|e| e.price < price)
        }
    }

    /// Index of the entry with `id`, via the price index plus a scan of the
    /// equal-price run. Prices compare bit-identical because both copies
    /// come from the same insert.
    fn locate(&self, id: u64) -> Option<usize> {
        let price = *self.index.get(&id)?;
        let start = self.position_for(price);
        self.entries[start..]
            .iter()
            .take_while(|e| e.price == price)
            .position(|e| e.id == id)
            .map(|off| start + off)
    }

    fn insert(&mut self, entry: BookEntry) {
        if self.index.contains_key(&entry.id) {
            // stale duplicate for this id; replace rather than corrupt
            self.remove(entry.id);
        }
        let pos = self.position_for(entry.price);
        if let Some(m) = &mut self.mirror {
            let mpos = m.len() - pos;
            m.insert(mpos, entry);
        }
        self.entries.insert(pos, entry);
        self.index.insert(entry.id, entry.price);
    }

    fn set_amount(&mut self, id: u64, amount: f64) -> bool {
        match self.locate(id) {
            Some(pos) => {
                self.entries[pos].amount = amount;
                if let Some(m) = &mut self.mirror {
                    let mpos = self.entries.len() - 1 - pos;
                    m[mpos].amount = amount;
                }
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: u64) -> bool {
        match self.locate(id) {
            Some(pos) => {
                if let Some(m) = &mut self.mirror {
                    let mpos = m.len() - 1 - pos;
                    m.remove(mpos);
                }
                self.entries.remove(pos);
                self.index.remove(&id);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        if let Some(m) = &mut self.mirror {
            m.clear();
        }
    }
}

/// Two-sided book with an is-dirty flag.
///
/// Readers take one or both side locks briefly; writers hold both through
/// an entire diff batch via [`OrderBook::update`].
#[derive(Debug)]
pub struct OrderBook {
    bids: Mutex<SideLevels>,
    asks: Mutex<SideLevels>,
    dirty: AtomicBool,
}

fn lock_side(side: &Mutex<SideLevels>) -> MutexGuard<'_, SideLevels> {
    side.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: Mutex::new(SideLevels::new(true, false)),
            asks: Mutex::new(SideLevels::new(false, false)),
            dirty: AtomicBool::new(false),
        }
    }

    /// Book that additionally maintains a descending mirror of the ask side.
    pub fn with_inverted_asks() -> Self {
        Self {
            bids: Mutex::new(SideLevels::new(true, false)),
            asks: Mutex::new(SideLevels::new(false, true)),
            dirty: AtomicBool::new(false),
        }
    }

    /// Begin an update bracket. Both side locks are held until the returned
    /// guard drops, so a whole snapshot replace is atomic for readers.
    /// Lock order is always bids before asks.
    pub fn update(&self) -> BookUpdate<'_> {
        BookUpdate {
            bids: lock_side(&self.bids),
            asks: lock_side(&self.asks),
            dirty: &self.dirty,
        }
    }

    /// Replace the whole book from a REST snapshot.
    pub fn apply_snapshot(&self, bids: Vec<BookEntry>, asks: Vec<BookEntry>) {
        let mut u = self.update();
        u.clear();
        for e in bids {
            u.apply(BookSide::Bid, BookOp::Add, e.id, Some(e.price), Some(e.amount));
        }
        for e in asks {
            u.apply(BookSide::Ask, BookOp::Add, e.id, Some(e.price), Some(e.amount));
        }
    }

    pub fn best_bid(&self) -> Option<BookEntry> {
        lock_side(&self.bids).entries.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookEntry> {
        lock_side(&self.asks).entries.first().copied()
    }

    /// Best bid and ask read under both locks (consistent pair).
    pub fn best_pair(&self) -> (Option<BookEntry>, Option<BookEntry>) {
        let bids = lock_side(&self.bids);
        let asks = lock_side(&self.asks);
        (bids.entries.first().copied(), asks.entries.first().copied())
    }

    pub fn mid_price(&self) -> Option<f64> {
        match self.best_pair() {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    pub fn depth(&self) -> (usize, usize) {
        let bids = lock_side(&self.bids);
        let asks = lock_side(&self.asks);
        (bids.entries.len(), asks.entries.len())
    }

    pub fn bid_levels(&self) -> Vec<BookEntry> {
        lock_side(&self.bids).entries.clone()
    }

    pub fn ask_levels(&self) -> Vec<BookEntry> {
        lock_side(&self.asks).entries.clone()
    }

    /// Descending view of the ask side, if this book maintains one.
    pub fn inverted_asks(&self) -> Option<Vec<BookEntry>> {
        lock_side(&self.asks).mirror.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII bracket over one batch of book mutations.
pub struct BookUpdate<'a> {
    bids: MutexGuard<'a, SideLevels>,
    asks: MutexGuard<'a, SideLevels>,
    dirty: &'a AtomicBool,
}

impl BookUpdate<'_> {
    /// Whether an entry with `id` currently exists on `side`. Lets
    /// price-keyed adapters turn absent-level removals into no-ops instead
    /// of false dirty marks.
    pub fn contains(&self, side: BookSide, id: u64) -> bool {
        let levels = match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        };
        levels.index.contains_key(&id)
    }

    /// Drop all levels on both sides. Clears the dirty flag: whatever is
    /// applied inside this bracket fully determines the new state.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.dirty.store(false, Ordering::Release);
    }

    /// Apply one incremental row. Unknown ids on Modify/Remove and rows with
    /// missing or non-finite fields degrade to "mark dirty", never panic.
    pub fn apply(
        &mut self,
        side: BookSide,
        op: BookOp,
        id: u64,
        price: Option<f64>,
        amount: Option<f64>,
    ) {
        let levels = match side {
            BookSide::Bid => &mut *self.bids,
            BookSide::Ask => &mut *self.asks,
        };
        match op {
            BookOp::Add | BookOp::RefreshAll => {
                let (price, amount) = match (price, amount) {
                    (Some(p), Some(a)) if p.is_finite() && a.is_finite() => (p, a),
                    _ => {
                        self.dirty.store(true, Ordering::Release);
                        return;
                    }
                };
                levels.insert(BookEntry { id, price, amount });
            }
            BookOp::Modify => {
                let amount = match amount {
                    Some(a) if a.is_finite() => a,
                    _ => {
                        self.dirty.store(true, Ordering::Release);
                        return;
                    }
                };
                if !levels.set_amount(id, amount) {
                    self.dirty.store(true, Ordering::Release);
                }
            }
            BookOp::Remove => {
                if !levels.remove(id) {
                    self.dirty.store(true, Ordering::Release);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(id: u64, price: f64, amount: f64) -> BookEntry {
        BookEntry { id, price, amount }
    }

    fn apply_add(book: &OrderBook, side: BookSide, id: u64, price: f64, amount: f64) {
        let mut u = book.update();
        u.apply(side, BookOp::Add, id, Some(price), Some(amount));
    }

    #[test]
    fn sides_stay_sorted() {
        let book = OrderBook::new();
        for (id, px) in [(1u64, 100.0), (2, 102.5), (3, 99.0), (4, 101.0)] {
            apply_add(&book, BookSide::Bid, id, px, 1.0);
            apply_add(&book, BookSide::Ask, id + 100, px + 10.0, 1.0);
        }
        let bids: Vec<f64> = book.bid_levels().iter().map(|e| e.price).collect();
        let asks: Vec<f64> = book.ask_levels().iter().map(|e| e.price).collect();
        assert_eq!(bids, vec![102.5, 101.0, 100.0, 99.0]);
        assert_eq!(asks, vec![109.0, 110.0, 111.0, 112.5]);
        assert_eq!(book.best_bid().map(|e| e.id), Some(2));
        assert_eq!(book.best_ask().map(|e| e.id), Some(103));
        assert_eq!(book.mid_price(), Some((102.5 + 109.0) / 2.0));
    }

    #[test]
    fn duplicate_prices_resolve_by_id() {
        let book = OrderBook::new();
        apply_add(&book, BookSide::Ask, 10, 50.0, 1.0);
        apply_add(&book, BookSide::Ask, 11, 50.0, 2.0);
        apply_add(&book, BookSide::Ask, 12, 50.0, 3.0);

        {
            let mut u = book.update();
            u.apply(BookSide::Ask, BookOp::Modify, 11, None, Some(9.0));
            u.apply(BookSide::Ask, BookOp::Remove, 10, None, None);
        }
        let asks = book.ask_levels();
        assert_eq!(asks.len(), 2);
        assert!(asks.iter().any(|e| e.id == 11 && e.amount == 9.0));
        assert!(asks.iter().all(|e| e.id != 10));
        assert!(!book.is_dirty());
    }

    #[test]
    fn modify_keeps_price_and_position() {
        let book = OrderBook::new();
        apply_add(&book, BookSide::Bid, 1, 101.0, 1.0);
        apply_add(&book, BookSide::Bid, 2, 100.0, 1.0);
        {
            let mut u = book.update();
            u.apply(BookSide::Bid, BookOp::Modify, 2, None, Some(7.5));
        }
        let bids = book.bid_levels();
        assert_eq!(bids[1], entry(2, 100.0, 7.5));
    }

    #[test]
    fn unknown_id_marks_dirty_and_leaves_book_intact() {
        let book = OrderBook::new();
        apply_add(&book, BookSide::Bid, 1, 100.0, 1.0);
        {
            let mut u = book.update();
            u.apply(BookSide::Bid, BookOp::Remove, 999, None, None);
            u.apply(BookSide::Bid, BookOp::Modify, 998, None, Some(2.0));
        }
        assert!(book.is_dirty());
        assert_eq!(book.bid_levels(), vec![entry(1, 100.0, 1.0)]);
    }

    #[test]
    fn refresh_all_replaces_previous_state() {
        let book = OrderBook::new();
        apply_add(&book, BookSide::Bid, 1, 100.0, 1.0);
        apply_add(&book, BookSide::Ask, 2, 101.0, 1.0);
        book.mark_dirty();

        {
            let mut u = book.update();
            u.clear();
            u.apply(BookSide::Bid, BookOp::RefreshAll, 5, Some(90.0), Some(4.0));
            u.apply(BookSide::Ask, BookOp::RefreshAll, 6, Some(91.0), Some(5.0));
        }
        assert_eq!(book.bid_levels(), vec![entry(5, 90.0, 4.0)]);
        assert_eq!(book.ask_levels(), vec![entry(6, 91.0, 5.0)]);
        // snapshot replace re-establishes a consistent book
        assert!(!book.is_dirty());
    }

    #[test]
    fn inverted_mirror_tracks_ask_side() {
        let book = OrderBook::with_inverted_asks();
        for (id, px) in [(1u64, 10.0), (2, 12.0), (3, 11.0), (4, 12.0)] {
            apply_add(&book, BookSide::Ask, id, px, 1.0);
        }
        {
            let mut u = book.update();
            u.apply(BookSide::Ask, BookOp::Modify, 3, None, Some(6.0));
            u.apply(BookSide::Ask, BookOp::Remove, 1, None, None);
        }
        let asks = book.ask_levels();
        let mut expect = asks.clone();
        expect.reverse();
        assert_eq!(book.inverted_asks().as_deref(), Some(expect.as_slice()));

        let plain = OrderBook::new();
        assert!(plain.inverted_asks().is_none());
    }

    #[test]
    fn snapshot_replace_is_atomic_for_readers() {
        let book = Arc::new(OrderBook::new());
        let lo: Vec<BookEntry> = (0..50).map(|i| entry(i, 100.0 - i as f64, 1.0)).collect();
        let hi: Vec<BookEntry> = (0..50).map(|i| entry(1000 + i, 500.0 - i as f64, 1.0)).collect();
        book.apply_snapshot(lo.clone(), Vec::new());

        let reader = {
            let book = Arc::clone(&book);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let bids = book.bid_levels();
                    // a half-applied swap would show up as a short or mixed side
                    assert_eq!(bids.len(), 50);
                    let top = bids[0].price;
                    assert!(top == 100.0 || top == 500.0, "mixed snapshot: top={top}");
                    assert!(bids.iter().all(|e| (e.id < 50) == (top == 100.0)));
                }
            })
        };
        for i in 0..200 {
            let next = if i % 2 == 0 { hi.clone() } else { lo.clone() };
            book.apply_snapshot(next, Vec::new());
        }
        reader.join().expect("reader panicked");
    }
}
