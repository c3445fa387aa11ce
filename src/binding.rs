//! Binding profiles: static tables mapping a device's native inputs and
//! outputs onto a well-known controller profile.

use crate::types::{InputName, OutputName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileName {
    SimpleController,
    IndexController,
}

/// Pairs are `(profile name, device name)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingProfile {
    pub name: ProfileName,
    pub inputs: &'static [(InputName, InputName)],
    pub outputs: &'static [(OutputName, OutputName)],
}

pub static PSMV_BINDINGS: &[BindingProfile] = &[
    BindingProfile {
        name: ProfileName::SimpleController,
        inputs: &[
            (InputName::SimpleSelectClick, InputName::PsmvTriggerValue),
            (InputName::SimpleMenuClick, InputName::PsmvMoveClick),
            (InputName::SimpleGripPose, InputName::PsmvBodyCenterPose),
            (InputName::SimpleAimPose, InputName::PsmvBodyCenterPose),
        ],
        outputs: &[(OutputName::SimpleVibration, OutputName::PsmvRumbleVibration)],
    },
    BindingProfile {
        name: ProfileName::IndexController,
        inputs: &[
            (InputName::IndexSystemClick, InputName::PsmvPsClick),
            (InputName::IndexAClick, InputName::PsmvCrossClick),
            (InputName::IndexBClick, InputName::PsmvCircleClick),
            (InputName::IndexTriggerValue, InputName::PsmvTriggerValue),
            (InputName::IndexGripPose, InputName::PsmvBodyCenterPose),
            (InputName::IndexAimPose, InputName::PsmvBallTipPose),
        ],
        outputs: &[(OutputName::IndexHaptic, OutputName::PsmvRumbleVibration)],
    },
];

pub fn find_profile(profiles: &[BindingProfile], name: ProfileName) -> Option<&BindingProfile> {
    profiles.iter().find(|p| p.name == name)
}

impl BindingProfile {
    /// Device input backing a profile input.
    pub fn map_input(&self, profile_input: InputName) -> Option<InputName> {
        self.inputs
            .iter()
            .find(|(from, _)| *from == profile_input)
            .map(|&(_, to)| to)
    }

    pub fn map_output(&self, profile_output: OutputName) -> Option<OutputName> {
        self.outputs
            .iter()
            .find(|(from, _)| *from == profile_output)
            .map(|&(_, to)| to)
    }
}
