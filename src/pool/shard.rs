/// Split `items` into `shards` contiguous, order-preserving chunks whose sizes
/// differ by at most one. Earlier shards take the remainder. Some shards are
/// empty when there are fewer items than shards.
pub fn partition<T>(items: Vec<T>, shards: usize) -> Vec<Vec<T>> {
    let shards = shards.max(1);
    let base = items.len() / shards;
    let extra = items.len() % shards;

    let mut out = Vec::with_capacity(shards);
    let mut iter = items.into_iter();
    for i in 0..shards {
        let size = base + usize::from(i < extra);
        out.push(iter.by_ref().take(size).collect());
    }
    out
}
