pub mod access;
pub mod auth;
pub mod config;
pub mod error;
pub mod model;
pub mod optimistic;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod summary;
pub mod ui_state;

#[cfg(feature = "desktop")]
mod commands;

pub use access::{ActionState, DenyPolicy, Permissions, Requirement};
pub use auth::{Actor, AuthError, AuthSession, Identity, IdentityProvider};
pub use config::{AppConfig, FeeCascade};
pub use error::{StoreError, StoreResult, SyndicError, SyndicResult};
pub use reconcile::{ReconcileOutcome, SkipReason};
pub use session::{DataSession, PaymentRow, SettingsUpdate, Snapshot, Workspace};
pub use store::{ChangeEvent, RemoteStore, RowChange, SqliteStore, Subscription};
pub use summary::Summary;

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use std::sync::Arc;

    use chrono::{Datelike, Local};
    use tauri::Manager;

    tauri::Builder::default()
        .setup(|app| {
            let data_dir = app.path().app_data_dir()?;
            let config = AppConfig::from_env(&data_dir)?;
            config::init_tracing(&config.log_filter);
            tracing::info!(path = %config.database_path.display(), "opening database");

            let store = Arc::new(SqliteStore::open(&config.database_path)?);
            let year = ui_state::clamp_year(Local::now().year());
            app.manage(commands::AppWorkspace::new(
                Arc::clone(&store),
                store,
                year,
                config.fee_cascade,
            ));

            let handle = app.handle().clone();
            tauri::async_runtime::spawn(async move {
                let workspace = handle.state::<commands::AppWorkspace>();
                if let Err(err) = workspace.start().await {
                    tracing::warn!(error = %err, "could not restore session");
                }
            });
            Ok(())
        })
        .plugin(tauri_plugin_opener::init())
        .invoke_handler(tauri::generate_handler![
            commands::sign_in,
            commands::sign_out,
            commands::bootstrap_admin,
            commands::get_session,
            commands::get_snapshot,
            commands::set_year,
            commands::sync_changes,
            commands::get_summary,
            commands::get_payment_matrix,
            commands::toggle_payment,
            commands::save_apartment,
            commands::delete_apartment,
            commands::add_expense,
            commands::delete_expense,
            commands::update_settings,
            commands::list_users,
            commands::update_user_role,
            commands::delete_user
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
