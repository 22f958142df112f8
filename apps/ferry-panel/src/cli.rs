use anyhow::{Context, Result};
use ferry_db::models::user::{AdminUserUpdate, NewUser};
use ferry_db::repositories::user_repo::UserRepository;
use sqlx::PgPool;
use std::env;
use std::fs;
use std::path::Path;

use crate::config::PanelConfig;
use crate::services::auth_service::hash_password;
use crate::utils;

const CONFIG_DIR: &str = "/etc/ferry";

/// Sets the password of `email` and grants it admin rights, creating the account if needed.
pub async fn reset_password(pool: &PgPool, email: &str, new_pass: &str) -> Result<()> {
    let hash = hash_password(new_pass)?;
    let users = UserRepository::new(pool.clone());

    match users.get_by_email(email).await? {
        Some(user) => {
            users.update_password(user.id, &hash).await?;
            if !user.is_admin {
                let promote = AdminUserUpdate {
                    is_admin: Some(true),
                    ..Default::default()
                };
                users.admin_update(user.id, &promote).await?;
            }
            println!("Password for '{}' has been successfully reset.", email);
        }
        None => {
            let mut tx = pool.begin().await.context("Failed to start transaction")?;
            let admin = NewUser {
                email: email.to_string(),
                password_hash: hash,
                uuid: uuid::Uuid::new_v4().to_string(),
                token: utils::guid(),
                invite_user_id: None,
                plan_id: None,
                group_id: None,
                transfer_enable: 0,
                speed_limit: None,
                expired_at: None,
                is_admin: true,
            };
            UserRepository::insert(&mut tx, &admin).await?;
            tx.commit().await.context("Failed to create admin")?;
            println!("New admin '{}' created successfully.", email);
        }
    }

    Ok(())
}

pub fn install_service() -> Result<()> {
    let exe_path = env::current_exe()?;
    let exe_name = exe_path
        .file_stem()
        .and_then(|n| n.to_str())
        .context("Executable name is not valid UTF-8")?
        .to_string();
    let working_dir = env::current_dir()?;

    if unsafe { libc::getuid() } != 0 {
        return Err(anyhow::anyhow!("This command must be run as root (sudo) to install systemd service."));
    }

    let config_path = Path::new(CONFIG_DIR).join("panel.toml");
    if config_path.exists() {
        println!("Keeping existing config at {}", config_path.display());
    } else {
        fs::create_dir_all(CONFIG_DIR).context(format!("Failed to create {}", CONFIG_DIR))?;
        fs::write(&config_path, PanelConfig::sample_toml()?)
            .context(format!("Failed to write config to {}", config_path.display()))?;
        println!("Sample config written to {}", config_path.display());
    }

    let service_path = format!("/etc/systemd/system/{}.service", exe_name);
    fs::write(&service_path, unit_file(&exe_path, &working_dir))
        .context(format!("Failed to write service file to {}", service_path))?;

    println!("Systemd service created at {}", service_path);
    println!("You can now start the service using:");
    println!("  systemctl daemon-reload");
    println!("  systemctl enable --now {}", exe_name);

    Ok(())
}

fn unit_file(exe_path: &Path, working_dir: &Path) -> String {
    format!(
        r#"[Unit]
Description=Ferry subscription panel
After=network.target postgresql.service redis.service

[Service]
Type=simple
User=root
WorkingDirectory={}
ExecStart={} serve
Restart=always
EnvironmentFile=-{}/.env

[Install]
WantedBy=multi-user.target
"#,
        working_dir.display(),
        exe_path.display(),
        working_dir.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_runs_serve_from_working_dir() {
        let unit = unit_file(Path::new("/opt/ferry/ferry-panel"), Path::new("/opt/ferry"));
        assert!(unit.contains("ExecStart=/opt/ferry/ferry-panel serve"));
        assert!(unit.contains("WorkingDirectory=/opt/ferry"));
        assert!(unit.contains("EnvironmentFile=-/opt/ferry/.env"));
    }
}
