/// Cache statistics. `alive` is a level: the current number of reffed
/// chunks across all slices. `read` and `written` count reanimations and
/// saves since the last latch.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Info {
    pub alive: u64,
    pub read: u64,
    pub written: u64,
}
