//! Per-subscriber filter state (spec.md §4.5).

use atrace_common::function_table::{self, FunctionTableEntry};
use atrace_common::{ErrorConvention, EventSlot, Status};

/// Sentinel `lib_id` that matches no real library, used when a subscriber
/// names a library the static table doesn't know about.
pub const LIB_ID_MATCHES_NONE: u8 = 255;
/// Sentinel `lvo` that matches no real function, for the same reason.
pub const LVO_MATCHES_NONE: i16 = 1;

#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// `None` matches any library.
    pub lib_id: Option<u8>,
    /// `None` matches any function.
    pub lvo: Option<i16>,
    pub errors_only: bool,
    /// Case-insensitive substring match against the resolved caller name;
    /// empty matches any caller.
    pub caller_substring: String,
}

impl Filter {
    pub fn any() -> Self {
        Self::default()
    }

    /// Resolve `LIB=name` to a concrete filter. A library the static table
    /// has never heard of narrows to the "matches none" sentinel rather than
    /// silently falling back to "matches any".
    pub fn with_lib_name(mut self, name: &str) -> Self {
        self.lib_id = Some(
            function_table::TABLE
                .iter()
                .find(|e| e.lib_name.eq_ignore_ascii_case(name))
                .map(|e| e.lib_id)
                .unwrap_or(LIB_ID_MATCHES_NONE),
        );
        self
    }

    /// Resolve `FUNC=name` the same way.
    pub fn with_func_name(mut self, name: &str) -> Self {
        self.lvo = Some(
            function_table::find_by_func_name(name)
                .map(|(_, e)| e.lvo)
                .unwrap_or(LVO_MATCHES_NONE),
        );
        self
    }

    pub fn with_errors_only(mut self, errors_only: bool) -> Self {
        self.errors_only = errors_only;
        self
    }

    pub fn with_caller_substring(mut self, substring: impl Into<String>) -> Self {
        self.caller_substring = substring.into();
        self
    }

    /// AND over every present criterion.
    pub fn matches(
        &self,
        slot: &EventSlot,
        caller_name: &str,
        entry: Option<&FunctionTableEntry>,
    ) -> bool {
        if let Some(want) = self.lib_id {
            if slot.lib_id != want {
                return false;
            }
        }
        if let Some(want) = self.lvo {
            if slot.lvo != want {
                return false;
            }
        }
        if self.errors_only && !passes_errors_only(entry, slot.retval) {
            return false;
        }
        if !self.caller_substring.is_empty() {
            let haystack = caller_name.to_ascii_lowercase();
            let needle = self.caller_substring.to_ascii_lowercase();
            if !haystack.contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// Per-convention errors-only classification (spec.md §4.5): void calls are
/// suppressed entirely in errors mode, calls with no clear convention are
/// always shown, everything else goes through its normal error mapping.
fn passes_errors_only(entry: Option<&FunctionTableEntry>, retval: u32) -> bool {
    let Some(entry) = entry else { return false };
    match entry.error_convention {
        ErrorConvention::Void => false,
        ErrorConvention::NoConvention => true,
        other => other.status(retval) == Status::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrace_common::slot::EventSlot;

    fn slot(lib_id: u8, lvo: i16, retval: u32) -> EventSlot {
        let mut s = EventSlot::zeroed();
        s.lib_id = lib_id;
        s.lvo = lvo;
        s.retval = retval;
        s
    }

    #[test]
    fn unknown_library_name_matches_nothing() {
        let filter = Filter::any().with_lib_name("totally-unknown");
        let entry = function_table::find_by_lvo(0, -552);
        assert!(!filter.matches(&slot(0, -552, 1), "shell", entry));
    }

    #[test]
    fn known_library_name_narrows_to_its_id() {
        let filter = Filter::any().with_lib_name("dos");
        assert_eq!(filter.lib_id, Some(function_table::LIB_DOS));
    }

    #[test]
    fn errors_only_suppresses_void_functions() {
        let filter = Filter::any().with_errors_only(true);
        // FreeMem is Void.
        let entry = function_table::find_by_lvo(function_table::LIB_EXEC, -210);
        assert!(!filter.matches(&slot(function_table::LIB_EXEC, -210, 0), "shell", entry));
    }

    #[test]
    fn errors_only_matches_pointer_null_failures() {
        let filter = Filter::any().with_errors_only(true);
        // OpenLibrary is PointerNullIsError.
        let entry = function_table::find_by_lvo(function_table::LIB_EXEC, -552);
        assert!(filter.matches(&slot(function_table::LIB_EXEC, -552, 0), "shell", entry));
        assert!(!filter.matches(&slot(function_table::LIB_EXEC, -552, 1), "shell", entry));
    }

    #[test]
    fn caller_substring_is_case_insensitive() {
        let filter = Filter::any().with_caller_substring("SHE");
        let entry = function_table::find_by_lvo(function_table::LIB_EXEC, -552);
        assert!(filter.matches(&slot(function_table::LIB_EXEC, -552, 1), "shell", entry));
        assert!(!filter.matches(&slot(function_table::LIB_EXEC, -552, 1), "editor", entry));
    }
}
