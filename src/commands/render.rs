//! Render command implementation.

use anyhow::Result;
use std::path::Path;

use crate::error::ProvisionError;
use crate::plan::Plan;
use crate::remote::Resource;

/// Create, update and delete steps of one resource.
pub fn render_resource(resource: &Resource) -> String {
    let mut out = format!("# {} create\n{}\n", resource.name, resource.create.describe());
    if let Some(update) = &resource.update {
        out.push_str(&format!("\n# {} update\n{}\n", resource.name, update.describe()));
    }
    if let Some(delete) = &resource.delete {
        out.push_str(&format!("\n# {} delete\n{}\n", resource.name, delete));
    }
    if !resource.depends_on.is_empty() {
        out.push_str(&format!("\n# depends on: {}\n", resource.depends_on.join(", ")));
    }
    out
}

/// Run the render command
pub async fn run(config_path: &Path, name: &str) -> Result<()> {
    let config = super::load_config(config_path)?;
    let plan = Plan::build(&config)?;

    let resource = plan.get(name).ok_or_else(|| {
        let known: Vec<&str> = plan.resources().iter().map(|r| r.name.as_str()).collect();
        ProvisionError::Config(format!(
            "Unknown resource '{}'. Known resources: {}",
            name,
            known.join(", ")
        ))
    })?;

    print!("{}", render_resource(resource));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_resource_sections() {
        let resource = Resource::script("rule/input-allow/ipv4", "iptables -I INPUT 1 -j X")
            .with_delete("iptables -D INPUT -j X")
            .depends_on(["firewall/precreate"]);
        let text = render_resource(&resource);
        assert_eq!(
            text,
            "# rule/input-allow/ipv4 create\niptables -I INPUT 1 -j X\n\
             \n# rule/input-allow/ipv4 delete\niptables -D INPUT -j X\n\
             \n# depends on: firewall/precreate\n"
        );
    }

    #[test]
    fn test_render_create_only() {
        let resource = Resource::script("firewall/save", "netfilter-persistent save");
        assert_eq!(
            render_resource(&resource),
            "# firewall/save create\nnetfilter-persistent save\n"
        );
    }
}
