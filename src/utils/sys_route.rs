use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Mutex;

/// Host routing table adapter
///
/// Installs a host route per container subnet, pointing at the tunnel's far
/// end so the kernel delivers matching traffic into the TUN. Every route
/// added through this adapter is tracked, so reload can remove exactly the
/// routes that disappeared and shutdown can remove everything this process
/// installed.
pub struct SysRoute {
    /// Gateway for all routes: the peer side of the point-to-point pair
    gateway: Ipv4Addr,
    installed: Mutex<HashSet<Ipv4Net>>,
}

impl SysRoute {
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self {
            gateway,
            installed: Mutex::new(HashSet::new()),
        }
    }

    /// Install a host route for `subnet` via the tunnel gateway
    pub fn add(&self, subnet: Ipv4Net) -> crate::Result<()> {
        self.add_route(&subnet.to_string(), &self.gateway.to_string())?;
        self.installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subnet);
        tracing::info!("added route {} via {}", subnet, self.gateway);
        Ok(())
    }

    /// Remove the host route for `subnet`. A route that is already gone is
    /// not an error.
    pub fn del(&self, subnet: Ipv4Net) -> crate::Result<()> {
        self.installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&subnet);
        self.del_route(&subnet.to_string(), &self.gateway.to_string())?;
        tracing::info!("removed route {} via {}", subnet, self.gateway);
        Ok(())
    }

    /// Remove every route this process installed. Called from the stop path
    /// and on drop of the supervisor; errors are logged, not propagated.
    pub fn clear(&self) {
        let routes: Vec<Ipv4Net> = self
            .installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for subnet in routes {
            if let Err(e) = self.del_route(&subnet.to_string(), &self.gateway.to_string()) {
                tracing::warn!("failed to remove route {}: {}", subnet, e);
            } else {
                tracing::info!("removed route {} via {}", subnet, self.gateway);
            }
        }
    }

    /// Subnets currently tracked as installed
    pub fn installed(&self) -> Vec<Ipv4Net> {
        self.installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    #[cfg(target_os = "linux")]
    fn add_route(&self, dst: &str, gateway: &str) -> crate::Result<()> {
        let output = Command::new("ip")
            .args(["route", "add", dst, "via", gateway])
            .output()
            .map_err(|e| format!("failed to execute ip command: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("File exists") {
                tracing::debug!("route already exists: {} via {}", dst, gateway);
                return Ok(());
            }
            return Err(format!("failed to add route: {}", stderr).into());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn del_route(&self, dst: &str, gateway: &str) -> crate::Result<()> {
        let output = Command::new("ip")
            .args(["route", "del", dst, "via", gateway])
            .output()
            .map_err(|e| format!("failed to execute ip command: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such process") || stderr.contains("not found") {
                tracing::debug!("route not found (already deleted): {}", dst);
                return Ok(());
            }
            return Err(format!("failed to delete route: {}", stderr).into());
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn add_route(&self, dst: &str, gateway: &str) -> crate::Result<()> {
        let output = Command::new("route")
            .args(["-n", "add", "-net", dst, gateway])
            .output()
            .map_err(|e| format!("failed to execute route command: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("failed to add route: {}", stderr).into());
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn del_route(&self, dst: &str, gateway: &str) -> crate::Result<()> {
        let output = Command::new("route")
            .args(["-n", "delete", "-net", dst, gateway])
            .output()
            .map_err(|e| format!("failed to execute route command: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not in table") {
                tracing::debug!("route not found (already deleted): {}", dst);
                return Ok(());
            }
            return Err(format!("failed to delete route: {}", stderr).into());
        }
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn add_route(&self, dst: &str, gateway: &str) -> crate::Result<()> {
        let (network, mask) = parse_cidr(dst)?;

        let output = Command::new("route")
            .args(["add", &network, "mask", &mask, gateway, "metric", "1"])
            .output()
            .map_err(|e| format!("failed to execute route command: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already exists") {
                tracing::debug!("route already exists: {} via {}", dst, gateway);
                return Ok(());
            }
            return Err(format!("failed to add route: {}", stderr).into());
        }
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn del_route(&self, dst: &str, _gateway: &str) -> crate::Result<()> {
        let (network, mask) = parse_cidr(dst)?;

        let output = Command::new("route")
            .args(["delete", &network, "mask", &mask])
            .output()
            .map_err(|e| format!("failed to execute route command: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") {
                tracing::debug!("route not found (already deleted): {}", dst);
                return Ok(());
            }
            return Err(format!("failed to delete route: {}", stderr).into());
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    fn add_route(&self, _dst: &str, _gateway: &str) -> crate::Result<()> {
        Err("route management is not supported on this platform".into())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    fn del_route(&self, _dst: &str, _gateway: &str) -> crate::Result<()> {
        Err("route management is not supported on this platform".into())
    }
}

#[allow(unused)]
fn parse_cidr(cidr: &str) -> crate::Result<(String, String)> {
    let parts: Vec<&str> = cidr.split('/').collect();
    if parts.len() != 2 {
        return Err(format!("invalid CIDR format: {}", cidr).into());
    }

    let network = parts[0].to_string();
    let prefix_len: u8 = parts[1]
        .parse()
        .map_err(|_| format!("invalid prefix length: {}", parts[1]))?;

    let mask = prefix_to_netmask(prefix_len)?;
    Ok((network, mask))
}

#[allow(unused)]
fn prefix_to_netmask(prefix_len: u8) -> crate::Result<String> {
    if prefix_len > 32 {
        return Err("invalid prefix length: must be 0-32".into());
    }

    let mask_int = if prefix_len == 0 {
        0u32
    } else {
        (!0u32) << (32 - prefix_len)
    };
    Ok(Ipv4Addr::from(mask_int).to_string())
}
