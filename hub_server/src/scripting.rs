//! Two extension-point seams for user-defined command/data rewriting. No
//! interpreter is embedded here; these traits are the real hook boundary
//! the Dispatcher calls through, with a no-op default chain.

use hub_common::Encoder;

/// Observes (and may veto or rewrite) an input command before it reaches
/// the simulator link.
pub trait InputFilter: Send + Sync {
    /// Return `None` to drop the command, `Some(bytes)` to forward it
    /// (unchanged or rewritten).
    fn filter(&self, command: &[u8]) -> Option<Vec<u8>>;
}

/// Observes (and may mutate) the encoder's buffer after a frame has been
/// copied in, before the encoder runs.
pub trait OutputMutator: Send + Sync {
    fn mutate(&self, encoder: &mut Encoder);
}

/// Runs `command` through every filter in order; short-circuits on the
/// first veto.
pub fn apply_input_filters(filters: &[Box<dyn InputFilter>], command: &[u8]) -> Option<Vec<u8>> {
    let mut current = command.to_vec();
    for filter in filters {
        current = filter.filter(&current)?;
    }
    Some(current)
}

/// Runs every output mutator against `encoder` in order.
pub fn apply_output_mutators(mutators: &[Box<dyn OutputMutator>], encoder: &mut Encoder) {
    for mutator in mutators {
        mutator.mutate(encoder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseFilter;
    impl InputFilter for UppercaseFilter {
        fn filter(&self, command: &[u8]) -> Option<Vec<u8>> {
            Some(command.to_ascii_uppercase())
        }
    }

    struct VetoFilter;
    impl InputFilter for VetoFilter {
        fn filter(&self, _command: &[u8]) -> Option<Vec<u8>> {
            None
        }
    }

    #[test]
    fn chain_applies_in_order() {
        let filters: Vec<Box<dyn InputFilter>> = vec![Box::new(UppercaseFilter)];
        let result = apply_input_filters(&filters, b"abc");
        assert_eq!(result, Some(b"ABC".to_vec()));
    }

    #[test]
    fn veto_short_circuits() {
        let filters: Vec<Box<dyn InputFilter>> = vec![Box::new(UppercaseFilter), Box::new(VetoFilter)];
        assert_eq!(apply_input_filters(&filters, b"abc"), None);
    }

    #[test]
    fn empty_chain_is_passthrough() {
        let filters: Vec<Box<dyn InputFilter>> = Vec::new();
        assert_eq!(apply_input_filters(&filters, b"abc"), Some(b"abc".to_vec()));
    }
}
