use embedded_storage::Storage;

/// Everything the store needs from the hardware: byte-granular reads and
/// writes at absolute offsets plus a monotonic clock. FRAM has no erase
/// blocks and no write alignment, so the plain [`Storage`] pair is the whole
/// transport contract. See README.md for an example implementation.
pub trait Platform: Storage + Clock {}

impl<T: Storage + Clock> Platform for T {}

/// Monotonic time source, seconds since boot or epoch. Used for block and
/// header timestamps only; the store never compares clocks across boots.
pub trait Clock {
    fn now_seconds(&mut self) -> u32;
    fn now_millis(&mut self) -> u32;
}

impl<T: Clock> Clock for &mut T {
    fn now_seconds(&mut self) -> u32 {
        T::now_seconds(self)
    }

    fn now_millis(&mut self) -> u32 {
        T::now_millis(self)
    }
}
