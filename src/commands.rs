use serde::Serialize;
use tauri::State;

use crate::access::Permissions;
use crate::auth::Identity;
use crate::model::{
    Apartment, ApartmentId, AppSettings, Expense, ExpenseId, NewApartment, NewExpense, Payment,
    PaymentId, Role, UserId, UserProfile,
};
use crate::reconcile::ReconcileOutcome;
use crate::session::{PaymentRow, SettingsUpdate, Snapshot, Workspace};
use crate::store::SqliteStore;
use crate::summary::Summary;

pub type AppWorkspace = Workspace<SqliteStore, SqliteStore>;

#[derive(Serialize)]
pub struct SessionInfo {
    identity: Option<Identity>,
    profile: Option<UserProfile>,
    permissions: Permissions,
    loading: bool,
}

#[tauri::command(rename_all = "snake_case")]
pub async fn sign_in(
    workspace: State<'_, AppWorkspace>,
    email: String,
    password: String,
) -> Result<Identity, String> {
    workspace
        .sign_in(&email, &password)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn sign_out(workspace: State<'_, AppWorkspace>) -> Result<(), String> {
    workspace.sign_out().await.map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn bootstrap_admin(
    workspace: State<'_, AppWorkspace>,
    email: String,
    password: String,
) -> Result<UserProfile, String> {
    workspace
        .bootstrap_admin(&email, &password)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub fn get_session(workspace: State<'_, AppWorkspace>) -> SessionInfo {
    let auth = workspace.auth();
    SessionInfo {
        identity: auth.identity(),
        profile: auth.profile(),
        permissions: auth.permissions(),
        loading: auth.is_loading(),
    }
}

#[tauri::command(rename_all = "snake_case")]
pub fn get_snapshot(workspace: State<'_, AppWorkspace>) -> Snapshot {
    workspace.data().snapshot()
}

#[tauri::command(rename_all = "snake_case")]
pub async fn set_year(
    workspace: State<'_, AppWorkspace>,
    year: i32,
) -> Result<ReconcileOutcome, String> {
    workspace
        .data()
        .set_year(year)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn sync_changes(workspace: State<'_, AppWorkspace>) -> Result<usize, String> {
    workspace.sync().await.map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub fn get_summary(workspace: State<'_, AppWorkspace>) -> Summary {
    workspace.data().summary()
}

#[tauri::command(rename_all = "snake_case")]
pub fn get_payment_matrix(
    workspace: State<'_, AppWorkspace>,
    search: Option<String>,
) -> Vec<PaymentRow> {
    workspace
        .data()
        .payment_matrix(search.as_deref().unwrap_or_default())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn toggle_payment(
    workspace: State<'_, AppWorkspace>,
    payment_id: PaymentId,
) -> Result<Payment, String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .toggle_payment(&actor, payment_id)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn save_apartment(
    workspace: State<'_, AppWorkspace>,
    apartment_id: Option<ApartmentId>,
    payload: NewApartment,
) -> Result<Apartment, String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .save_apartment(&actor, apartment_id, payload)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn delete_apartment(
    workspace: State<'_, AppWorkspace>,
    apartment_id: ApartmentId,
) -> Result<(), String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .delete_apartment(&actor, apartment_id)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn add_expense(
    workspace: State<'_, AppWorkspace>,
    payload: NewExpense,
) -> Result<Expense, String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .add_expense(&actor, payload)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn delete_expense(
    workspace: State<'_, AppWorkspace>,
    expense_id: ExpenseId,
) -> Result<(), String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .delete_expense(&actor, expense_id)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn update_settings(
    workspace: State<'_, AppWorkspace>,
    payload: AppSettings,
) -> Result<SettingsUpdate, String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .update_settings(&actor, payload)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn list_users(workspace: State<'_, AppWorkspace>) -> Result<Vec<UserProfile>, String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .list_users(&actor)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn update_user_role(
    workspace: State<'_, AppWorkspace>,
    user_id: String,
    role: Role,
) -> Result<(), String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .update_user_role(&actor, &UserId::new(user_id), role)
        .await
        .map_err(|err| err.to_string())?;
    workspace.auth().refresh_profile().await;
    Ok(())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn delete_user(
    workspace: State<'_, AppWorkspace>,
    user_id: String,
) -> Result<(), String> {
    let actor = workspace.actor().map_err(|err| err.to_string())?;
    workspace
        .data()
        .delete_user(&actor, &UserId::new(user_id))
        .await
        .map_err(|err| err.to_string())
}
