use std::collections::BTreeMap;

use gauntlet::{Flavor, FlavorCatalog, FlavorId, Stage, Step, TestMatrix};

/// A step bound to `flavor` whose command always succeeds.
pub fn step(name: &str, flavor: &str) -> Step {
    step_with_command(name, flavor, "true")
}

/// A step bound to `flavor` running `command`.
pub fn step_with_command(name: &str, flavor: &str, command: &str) -> Step {
    Step {
        name: name.to_string(),
        flavor: FlavorId::from(flavor),
        command: command.to_string(),
        tp_degree: None,
        env: BTreeMap::new(),
        working_dir: None,
        variant: None,
    }
}

/// A named stage from a list of steps.
pub fn stage(name: &str, steps: Vec<Step>) -> Stage {
    Stage {
        name: name.to_string(),
        steps,
    }
}

/// A matrix from ordered stages.
pub fn matrix(stages: Vec<Stage>) -> TestMatrix {
    TestMatrix { stages }
}

/// A catalog of `(name, capacity)` flavors, each with tp_width 1.
pub fn catalog(flavors: &[(&str, usize)]) -> FlavorCatalog {
    FlavorCatalog::from_flavors(flavors.iter().map(|(name, capacity)| Flavor {
        id: FlavorId::from(*name),
        capacity: *capacity,
        tp_width: 1,
    }))
}
