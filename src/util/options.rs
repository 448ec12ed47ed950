use std::fmt::Debug;
use std::str::FromStr;
use strum_macros::EnumString;

/// Page-heap debug placement. `BlockStart` puts the allocation at the start
/// of its own page run with a trailing guard page; `BlockEnd` pushes it
/// against the end with a leading guard page, so underruns and overruns
/// fault immediately.
#[derive(Copy, Clone, EnumString, Debug, PartialEq, Eq)]
pub enum PageHeapMode {
    Off,
    BlockStart,
    BlockEnd,
}

/// Which bucket families participate in page-heap mode.
#[derive(Copy, Clone, EnumString, Debug, PartialEq, Eq)]
pub enum PageHeapBlockKind {
    None,
    Small,
    Medium,
    Large,
    All,
}

impl PageHeapBlockKind {
    pub fn includes_small(self) -> bool {
        matches!(self, PageHeapBlockKind::Small | PageHeapBlockKind::All)
    }
    pub fn includes_medium(self) -> bool {
        matches!(self, PageHeapBlockKind::Medium | PageHeapBlockKind::All)
    }
    pub fn includes_large(self) -> bool {
        matches!(self, PageHeapBlockKind::Large | PageHeapBlockKind::All)
    }
}

/// When to start a collection on the allocation path.
///
/// The format is either `Default` (use the built-in heuristic thresholds) or
/// `FixedBytes:<size>` with an optional k/m/g suffix, e.g. `FixedBytes:64m`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectTriggerSelector {
    Default,
    FixedBytes(usize),
}

impl CollectTriggerSelector {
    /// Parse a size string such as "4m" or "65536" into bytes.
    pub fn parse_size(s: &str) -> Result<usize, String> {
        let s = s.to_lowercase();
        if let Some(size) = s.strip_suffix('k') {
            size.parse::<usize>()
                .map(|size| size << 10)
                .map_err(|e| e.to_string())
        } else if let Some(size) = s.strip_suffix('m') {
            size.parse::<usize>()
                .map(|size| size << 20)
                .map_err(|e| e.to_string())
        } else if let Some(size) = s.strip_suffix('g') {
            size.parse::<usize>()
                .map(|size| size << 30)
                .map_err(|e| e.to_string())
        } else {
            s.parse::<usize>().map_err(|e| e.to_string())
        }
    }
}

impl FromStr for CollectTriggerSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref FIXED_BYTES_REGEX: regex::Regex =
                regex::Regex::new(r"^FixedBytes:(?P<size>\d+[kKmMgG]?)$").unwrap();
        }

        if s.is_empty() {
            return Err("No collect trigger policy is supplied".to_string());
        }
        if s == "Default" {
            return Ok(Self::Default);
        }
        if let Some(captures) = FIXED_BYTES_REGEX.captures(s) {
            return Self::parse_size(&captures["size"]).map(Self::FixedBytes);
        }
        Err(format!("Failed to parse the collect trigger option: {:?}", s))
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

/// A recycler option of a given type. This type allows us to store some
/// metadata for the option. To get the value of an option, you can simply
/// dereference it (for example, `*options.concurrent`).
#[derive(Clone)]
pub struct RecyclerOption<T: Debug + Clone> {
    /// The actual value for the option
    value: T,
    /// The validator to ensure the value is valid.
    validator: fn(&T) -> bool,
    /// Can we set this option through env vars?
    from_env_var: bool,
}

impl<T: Debug + Clone> RecyclerOption<T> {
    pub fn new(value: T, validator: fn(&T) -> bool, from_env_var: bool) -> Self {
        RecyclerOption {
            value,
            validator,
            from_env_var,
        }
    }

    /// Set the option to the given value. Returns true if the value passed
    /// the option's validator and was stored.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

// Dereference an option to get its value.
impl<T: Debug + Clone> std::ops::Deref for RecyclerOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

macro_rules! options {
    ($($(#[$outer:meta])*$name:ident: $type:ty [env_var: $env_var:expr] [$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])*$name: $type [env_var: $env_var] [$validator] = $default),*);
    ];
    ($($(#[$outer:meta])*$name:ident: $type:ty [env_var: $env_var:expr] [$validator:expr] = $default:expr),*) => [
        /// The tunable flag table for a recycler instance.
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])*pub $name: RecyclerOption<$type>),*
        }

        impl Options {
            /// Set an option from an env var value.
            pub fn set_from_env_var(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => {
                        assert!(self.$name.from_env_var, "cannot set option {} from env var", s);
                    }),*
                    _ => panic!("Invalid Options key: {}", s)
                }
                self.set_inner(s, val)
            }

            /// Bulk process options from `key=value` pairs separated by
            /// whitespace or commas. Returns true if every pair parsed and
            /// validated.
            pub fn set_bulk(&mut self, options: &str) -> bool {
                for opt in options.replace(',', " ").split_ascii_whitespace() {
                    let kv_pair: Vec<&str> = opt.split('=').collect();
                    if kv_pair.len() != 2 {
                        return false;
                    }
                    if !self.set_inner(kv_pair[0], kv_pair[1]) {
                        return false;
                    }
                }
                true
            }

            /// Set an option and run its validator for its value.
            fn set_inner(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(typed_val) = val.parse::<$type>() {
                        let is_set = self.$name.set(typed_val);
                        if !is_set {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_set
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Can't parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }

            fn new() -> Self {
                Options {
                    $($name: RecyclerOption::new($default, $validator, $env_var)),*
                }
            }

            /// Read options from environment variables starting with `RCY_`
            /// (such as `RCY_CONCURRENT`), and apply them to self.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "RCY_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_env_var(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }

        impl Default for Options {
            fn default() -> Self {
                Self::new()
            }
        }
    ]
}

options! {
    /// Run collections concurrently on a background thread when the trigger
    /// allows it.
    concurrent:                    bool                   [env_var: true] [always_valid] = true,
    /// Number of parallel mark worker threads in addition to the marking
    /// thread itself.
    parallel_mark_worker_count:    usize                  [env_var: true] [|v: &usize| *v <= 3] = std::cmp::min(3, num_cpus::get().saturating_sub(1)),
    /// Allow partial collections that only process pages meeting the
    /// free-byte reuse threshold.
    partial:                       bool                   [env_var: true] [always_valid] = true,
    /// Cap on pooled free pages per page allocator before decommit kicks in.
    max_free_page_count:           usize                  [env_var: true] [|v: &usize| *v > 0] = 1024,
    /// Decommit pooled pages from a dedicated thread when the host reports
    /// idle time.
    idle_decommit:                 bool                   [env_var: true] [always_valid] = true,
    /// When to start a collection on the allocation path.
    collect_trigger:               CollectTriggerSelector [env_var: true] [always_valid] = CollectTriggerSelector::Default,
    /// How long the foreground waits for the background thread before
    /// finishing a concurrent pass in-thread, in milliseconds.
    finish_concurrent_timeout_ms:  u64                    [env_var: true] [|v: &u64| *v > 0] = 25,
    /// Page-heap debug placement mode.
    page_heap:                     PageHeapMode           [env_var: true] [always_valid] = PageHeapMode::Off,
    /// Which bucket families page-heap mode applies to.
    page_heap_block_type:          PageHeapBlockKind      [env_var: true] [always_valid] = PageHeapBlockKind::All,
    /// Capture an allocation backtrace for page-heap blocks.
    page_heap_alloc_stack:         bool                   [env_var: true] [always_valid] = false,
    /// Capture a free backtrace for page-heap blocks.
    page_heap_free_stack:          bool                   [env_var: true] [always_valid] = false,
    /// Dump per-bucket fragmentation stats after each collection.
    dump_fragmentation_stats:      bool                   [env_var: true] [always_valid] = false,
    /// Walk marked objects after mark and assert their referents are marked.
    verify_mark:                   bool                   [env_var: true] [always_valid] = false,
    /// Walk every block list after each phase and validate counts.
    check_heap:                    bool                   [env_var: true] [always_valid] = false,
    /// Never reuse swept pages; release them to the allocator instead.
    no_page_reuse:                 bool                   [env_var: true] [always_valid] = false,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = Options::default();
        assert!(*options.concurrent);
        assert!(*options.parallel_mark_worker_count <= 3);
        assert_eq!(*options.page_heap, PageHeapMode::Off);
        assert_eq!(*options.collect_trigger, CollectTriggerSelector::Default);
    }

    #[test]
    fn set_bulk_parses_pairs() {
        let mut options = Options::default();
        assert!(options.set_bulk("concurrent=false,parallel_mark_worker_count=2"));
        assert!(!*options.concurrent);
        assert_eq!(*options.parallel_mark_worker_count, 2);
    }

    #[test]
    fn validator_rejects_out_of_range() {
        let mut options = Options::default();
        assert!(!options.set_bulk("parallel_mark_worker_count=9"));
        assert!(*options.parallel_mark_worker_count <= 3);
    }

    #[test]
    fn collect_trigger_parses_sizes() {
        assert_eq!(
            "FixedBytes:64m".parse::<CollectTriggerSelector>().unwrap(),
            CollectTriggerSelector::FixedBytes(64 << 20)
        );
        assert_eq!(
            "FixedBytes:4096".parse::<CollectTriggerSelector>().unwrap(),
            CollectTriggerSelector::FixedBytes(4096)
        );
        assert_eq!(
            "Default".parse::<CollectTriggerSelector>().unwrap(),
            CollectTriggerSelector::Default
        );
        assert!("FixedBytes:".parse::<CollectTriggerSelector>().is_err());
    }

    #[test]
    fn page_heap_modes_parse() {
        let mut options = Options::default();
        assert!(options.set_bulk("page_heap=BlockEnd,page_heap_block_type=Large"));
        assert_eq!(*options.page_heap, PageHeapMode::BlockEnd);
        assert!(options.page_heap_block_type.includes_large());
        assert!(!options.page_heap_block_type.includes_small());
    }
}
