//! Table errors.
//!
//! Concurrency conflicts are never errors — readers retry internally and writers spin — so what
//! remains are capacity conditions a caller can actually do something about, and plain misuse of
//! the configuration knobs.

quick_error! {
    /// A table operation error.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Error {
        /// An automatic expansion fired while the table was too empty.
        ///
        /// Expansion is triggered by failing to place a key, and a table that cannot place keys
        /// while mostly empty is a table whose hash function is not distributing them. Doubling
        /// would paper over that at an exponential memory cost, so the insert fails instead. The
        /// payload is the load factor at the time of the attempt.
        LoadFactorTooLow(lf: f64) {
            description("Automatic expansion triggered below the minimum load factor.")
            display("Automatic expansion triggered at load factor {}, below the configured minimum.", lf)
        }
        /// An expansion would have grown the table beyond the configured maximum hashpower.
        ///
        /// The payload is the hashpower the expansion was aiming for.
        MaximumHashpowerExceeded(hp: usize) {
            description("Expansion beyond the maximum hashpower.")
            display("Expansion to hashpower {} exceeds the configured maximum.", hp)
        }
        /// A configuration knob was handed a nonsensical value.
        InvalidArgument(what: &'static str) {
            description("Invalid argument.")
            display("Invalid argument: {}.", what)
        }
    }
}
