//! Maps an [`Event`] to the ordered enforcement steps that realise it.

use crate::error::FilterError;
use crate::filter::Filter;
use crate::types::{Action, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InstallAccept,
    InstallMasquerade,
    InstallForward,
    RemoveAccept,
    RemoveMasquerade,
    RemoveForward,
}

impl Step {
    pub async fn run(self, filter: &dyn Filter, address: &str) -> Result<(), FilterError> {
        match self {
            Step::InstallAccept => filter.install_accept_rule(address).await,
            Step::InstallMasquerade => filter.install_masquerade_rule(address).await,
            Step::InstallForward => filter.install_forward_rules(address).await,
            Step::RemoveAccept => filter.remove_accept_rule(address).await,
            Step::RemoveMasquerade => filter.remove_masquerade_rule(address).await,
            Step::RemoveForward => filter.remove_forward_rules(address).await,
        }
    }
}

const ADD_REMOTE: &[Step] = &[
    Step::InstallAccept,
    Step::InstallMasquerade,
    Step::InstallForward,
];
const ADD_LOCAL: &[Step] = &[Step::InstallAccept];
const DELETE_REMOTE: &[Step] = &[
    Step::RemoveAccept,
    Step::RemoveMasquerade,
    Step::RemoveForward,
];
const DELETE_LOCAL: &[Step] = &[Step::RemoveAccept];

/// Returns the steps for `event`, or `None` when its action is unknown and
/// the event should be dropped.
pub fn plan(event: &Event) -> Option<&'static [Step]> {
    match (event.action(), event.is_local_net()) {
        (Action::Add, false) => Some(ADD_REMOTE),
        (Action::Add, true) => Some(ADD_LOCAL),
        (Action::Delete, false) => Some(DELETE_REMOTE),
        (Action::Delete, true) => Some(DELETE_LOCAL),
        (Action::Unknown, _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_add_installs_accept_before_nat_and_forward() {
        assert_eq!(
            plan(&Event::add("8.8.8.8")).unwrap(),
            &[
                Step::InstallAccept,
                Step::InstallMasquerade,
                Step::InstallForward
            ]
        );
    }

    #[test]
    fn local_addresses_only_touch_accept_rules() {
        assert_eq!(
            plan(&Event::add("10.0.0.5")).unwrap(),
            &[Step::InstallAccept]
        );
        assert_eq!(
            plan(&Event::delete("192.168.3.4")).unwrap(),
            &[Step::RemoveAccept]
        );
    }

    #[test]
    fn remote_delete_mirrors_add() {
        assert_eq!(
            plan(&Event::delete("1.2.3.4")).unwrap(),
            &[
                Step::RemoveAccept,
                Step::RemoveMasquerade,
                Step::RemoveForward
            ]
        );
    }

    #[test]
    fn unknown_action_has_no_plan() {
        assert!(plan(&Event::new(Action::Unknown, "1.2.3.4")).is_none());
    }
}
