//! Replace the contents of an ipset without a window where the set is empty.
//!
//! On first apply the set is created and filled in place. Afterwards a shadow set is
//! built next to the live one and exchanged with `ipset swap`, so rules referencing the
//! set never observe a partial list.

use super::ipset::IpSet;
use crate::shell::{and_all, quote, ProbeThenAct};

pub const SHADOW_SUFFIX: &str = "-NEW";

fn probe(name: &str) -> String {
    format!("ipset list {} -name", name)
}

fn guarded_destroy(name: &str) -> String {
    ProbeThenAct::new(probe(name))
        .when_present(format!("ipset destroy {}", name))
        .render()
}

/// `ipset swap` refuses sets of different types, so a live set of another type stops
/// the script before the shadow set is built.
fn type_guard(set: &IpSet) -> String {
    format!(
        "[ \"$(ipset list {name} -t | sed -n 's/^Type: //p')\" == {set_type} ] || {{ echo {message} >&2; exit 1; }}",
        name = set.name(),
        set_type = quote(&set.set_type().to_string()),
        message = quote(&format!(
            "ipset {} exists with a type other than {}; destroy it before changing the type",
            set.name(),
            set.set_type()
        )),
    )
}

/// Script that leaves the live set holding exactly the declared entries.
pub fn apply_script(set: &IpSet) -> String {
    let name = set.name();
    let shadow = format!("{}{}", name, SHADOW_SUFFIX);

    let fill_in_place = and_all(
        std::iter::once(set.create_command("")).chain(set.add_commands("")),
    );

    let swap = and_all(
        [
            type_guard(set),
            guarded_destroy(&shadow),
            set.create_command(SHADOW_SUFFIX),
        ]
            .into_iter()
            .chain(set.add_commands(SHADOW_SUFFIX))
            .chain([
                format!("ipset swap {} {}", shadow, name),
                format!("ipset destroy {}", shadow),
            ]),
    );

    ProbeThenAct::new(probe(name))
        .when_absent(fill_in_place)
        .when_present(swap)
        .render()
}

/// Script that removes the set if it exists.
pub fn destroy_script(set: &IpSet) -> String {
    guarded_destroy(set.name())
}
