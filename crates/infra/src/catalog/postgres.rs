//! Postgres-backed role catalog.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (other) | any other | `Backend` |
//! | RowNotFound | N/A | `NotFound` |
//! | PoolClosed, I/O, decode | N/A | `Backend` |

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use warden_auth::{NewPermission, Permission, PolicyRule, PolicyType, Role, User, user_subject};
use warden_core::{PermissionId, RoleId, UserId};

use super::{ListQuery, RbacStore, StoreError, grouping_rules, permission_rules};

const MIGRATIONS: [(&str, &str); 2] = [
    ("0001_rbac", include_str!("../../migrations/0001_rbac.sql")),
    ("0002_user_subject_prefix", include_str!("../../migrations/0002_user_subject_prefix.sql")),
];

/// Role catalog on a Postgres pool.
///
/// Every write is one transaction; association rows and the matching
/// `policy_rules` rows are rewritten together before commit.
#[derive(Debug, Clone)]
pub struct PostgresRbacStore {
    pool: PgPool,
}

impl PostgresRbacStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the catalog tables if they do not exist yet and bring old
    /// projection rows up to date. Every script is safe to re-run.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for (name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(name, e))?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn insert_rules(
    tx: &mut Transaction<'static, Postgres>,
    rules: &[PolicyRule],
) -> Result<(), StoreError> {
    for rule in rules {
        let (ptype, v0, v1, v2) = rule.to_columns();
        sqlx::query(
            r#"
            INSERT INTO policy_rules (ptype, v0, v1, v2)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ptype, v0, v1, v2) DO NOTHING
            "#,
        )
        .bind(ptype.as_str())
        .bind(v0)
        .bind(v1)
        .bind(v2.unwrap_or(""))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_policy_rule", e))?;
    }
    Ok(())
}

/// Replace the role's permission association and its `p` rules.
async fn write_role_permissions(
    tx: &mut Transaction<'static, Postgres>,
    role: &Role,
    permissions: &[Permission],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
        .bind(role.id.get())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("clear_role_permissions", e))?;

    for p in permissions {
        sqlx::query("INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(role.id.get())
            .bind(p.id.get())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_role_permission", e))?;
    }

    sqlx::query("DELETE FROM policy_rules WHERE ptype = $1 AND v0 = $2")
        .bind(PolicyType::P.as_str())
        .bind(&role.name)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("clear_permission_rules", e))?;

    insert_rules(tx, &permission_rules(&role.name, permissions)).await
}

/// Replace the user's role association and its `g` rules.
async fn write_user_roles(
    tx: &mut Transaction<'static, Postgres>,
    user: UserId,
    roles: &[Role],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
        .bind(user.get())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("clear_user_roles", e))?;

    for r in roles {
        sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(user.get())
            .bind(r.id.get())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_user_role", e))?;
    }

    sqlx::query("DELETE FROM policy_rules WHERE ptype = $1 AND v0 = $2")
        .bind(PolicyType::G.as_str())
        .bind(user_subject(user))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("clear_grouping_rules", e))?;

    insert_rules(tx, &grouping_rules(user, roles)).await
}

#[async_trait]
impl RbacStore for PostgresRbacStore {
    #[instrument(skip(self, new), fields(name = %new.name), err)]
    async fn insert_permission(&self, new: NewPermission) -> Result<Permission, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO permissions (name, path, method, description)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&new.name)
        .bind(&new.path)
        .bind(&new.method)
        .bind(&new.description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_permission", e))?;

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("insert_permission", e))?;
        Ok(new.into_permission(PermissionId::new(id)))
    }

    #[instrument(skip(self), err)]
    async fn list_permissions(&self, query: &ListQuery) -> Result<Vec<Permission>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, path, method, description
            FROM permissions
            WHERE ($1::TEXT IS NULL OR starts_with(name, $1))
            ORDER BY id
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(query.name_prefix.as_deref())
        .bind(i64::from(query.offset))
        .bind(query.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_permissions", e))?;
        rows.iter().map(permission_from_row).collect()
    }

    #[instrument(skip(self, description), fields(permission_id = %id), err)]
    async fn update_permission_description(
        &self,
        id: PermissionId,
        description: &str,
    ) -> Result<Permission, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE permissions SET description = $2
            WHERE id = $1
            RETURNING id, name, path, method, description
            "#,
        )
        .bind(id.get())
        .bind(description)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_permission_description", e))?;

        match row {
            Some(row) => permission_from_row(&row),
            None => Err(StoreError::NotFound(format!("permission {id}"))),
        }
    }

    #[instrument(skip(self), err)]
    async fn find_permissions(&self, ids: &[PermissionId]) -> Result<Vec<Permission>, StoreError> {
        let ids: Vec<i64> = ids.iter().map(PermissionId::get).collect();
        let rows = sqlx::query(
            "SELECT id, name, path, method, description FROM permissions WHERE id = ANY($1) ORDER BY id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_permissions", e))?;
        rows.iter().map(permission_from_row).collect()
    }

    #[instrument(skip(self), fields(permission_id = %id), err)]
    async fn roles_using_permission(&self, id: PermissionId) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.name
            FROM roles r
            JOIN role_permissions rp ON rp.role_id = r.id
            WHERE rp.permission_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("roles_using_permission", e))?;
        names_from_rows(&rows)
    }

    #[instrument(skip(self), fields(permission_id = %id), err)]
    async fn delete_permission(&self, id: PermissionId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM permissions WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_permission", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("permission {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(role_id = %id), err)]
    async fn find_role(&self, id: RoleId) -> Result<Option<Role>, StoreError> {
        let row = sqlx::query("SELECT id, name, description FROM roles WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_role", e))?;
        row.as_ref().map(role_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError> {
        let row = sqlx::query("SELECT id, name, description FROM roles WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_role_by_name", e))?;
        row.as_ref().map(role_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_roles(&self, ids: &[RoleId]) -> Result<Vec<Role>, StoreError> {
        let ids: Vec<i64> = ids.iter().map(RoleId::get).collect();
        let rows = sqlx::query("SELECT id, name, description FROM roles WHERE id = ANY($1) ORDER BY id")
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_roles", e))?;
        rows.iter().map(role_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_roles(&self, query: &ListQuery) -> Result<Vec<Role>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, description
            FROM roles
            WHERE ($1::TEXT IS NULL OR starts_with(name, $1))
            ORDER BY id
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(query.name_prefix.as_deref())
        .bind(i64::from(query.offset))
        .bind(query.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_roles", e))?;
        rows.iter().map(role_from_row).collect()
    }

    #[instrument(skip(self), fields(role_id = %id), err)]
    async fn role_permissions(&self, id: RoleId) -> Result<Vec<Permission>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.path, p.method, p.description
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = $1
            ORDER BY p.id
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_permissions", e))?;
        rows.iter().map(permission_from_row).collect()
    }

    #[instrument(skip(self), fields(role_id = %id), err)]
    async fn users_with_role(&self, id: RoleId) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT u.name
            FROM users u
            JOIN user_roles ur ON ur.user_id = u.id
            WHERE ur.role_id = $1
            ORDER BY u.name
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("users_with_role", e))?;
        names_from_rows(&rows)
    }

    #[instrument(skip(self, description, permissions), fields(permissions = permissions.len()), err)]
    async fn insert_role(
        &self,
        name: &str,
        description: &str,
        permissions: &[Permission],
    ) -> Result<Role, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query("INSERT INTO roles (name, description) VALUES ($1, $2) RETURNING id")
            .bind(name)
            .bind(description)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_role", e))?;
        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("insert_role", e))?;

        let role = Role {
            id: RoleId::new(id),
            name: name.to_string(),
            description: description.to_string(),
        };
        write_role_permissions(&mut tx, &role, permissions).await?;

        commit(tx).await?;
        Ok(role)
    }

    #[instrument(skip(self, description, permissions), fields(role_id = %id, permissions = permissions.len()), err)]
    async fn update_role(
        &self,
        id: RoleId,
        description: &str,
        permissions: &[Permission],
    ) -> Result<Role, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE roles SET description = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, description
            "#,
        )
        .bind(id.get())
        .bind(description)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_role", e))?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("role {id}")));
        };
        let role = role_from_row(&row)?;
        write_role_permissions(&mut tx, &role, permissions).await?;

        commit(tx).await?;
        Ok(role)
    }

    #[instrument(skip(self), fields(role_id = %id), err)]
    async fn delete_role(&self, id: RoleId) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query("SELECT id, name, description FROM roles WHERE id = $1 FOR UPDATE")
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_role", e))?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("role {id}")));
        };
        let role = role_from_row(&row)?;

        write_role_permissions(&mut tx, &role, &[]).await?;

        // user_roles references roles with ON DELETE RESTRICT.
        sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_role", e))?;

        commit(tx).await
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, name FROM users WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_user", e))?;
        row.as_ref().map(user_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_users(&self, query: &ListQuery) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name
            FROM users
            WHERE ($1::TEXT IS NULL OR starts_with(name, $1))
            ORDER BY id
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(query.name_prefix.as_deref())
        .bind(i64::from(query.offset))
        .bind(query.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_users", e))?;
        rows.iter().map(user_from_row).collect()
    }

    #[instrument(skip(self, roles), fields(roles = roles.len()), err)]
    async fn insert_user(&self, name: &str, roles: &[Role]) -> Result<User, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query("INSERT INTO users (name) VALUES ($1) RETURNING id, name")
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_user", e))?;
        let user = user_from_row(&row)?;
        write_user_roles(&mut tx, user.id, roles).await?;

        commit(tx).await?;
        Ok(user)
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn role_names_for_user(&self, id: UserId) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.name
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_names_for_user", e))?;
        names_from_rows(&rows)
    }

    #[instrument(skip(self, roles), fields(user_id = %id, roles = roles.len()), err)]
    async fn replace_user_roles(&self, id: UserId, roles: &[Role]) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let locked = sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_user", e))?;
        if locked.is_none() {
            return Err(StoreError::NotFound(format!("user {id}")));
        }

        write_user_roles(&mut tx, id, roles).await?;
        commit(tx).await
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn delete_user(&self, id: UserId) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        write_user_roles(&mut tx, id, &[]).await?;

        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_user", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {id}")));
        }

        commit(tx).await
    }

    #[instrument(skip(self), err)]
    async fn policy_rules(&self) -> Result<Vec<PolicyRule>, StoreError> {
        let rows = sqlx::query("SELECT ptype, v0, v1, v2 FROM policy_rules ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("policy_rules", e))?;

        rows.iter()
            .map(|row| {
                let ptype: String = row.try_get("ptype").map_err(|e| map_sqlx_error("policy_rules", e))?;
                let v0: String = row.try_get("v0").map_err(|e| map_sqlx_error("policy_rules", e))?;
                let v1: String = row.try_get("v1").map_err(|e| map_sqlx_error("policy_rules", e))?;
                let v2: String = row.try_get("v2").map_err(|e| map_sqlx_error("policy_rules", e))?;
                PolicyRule::from_columns(&ptype, v0, v1, Some(v2))
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .collect()
    }
}

fn permission_from_row(row: &PgRow) -> Result<Permission, StoreError> {
    let decode = |e| map_sqlx_error("decode_permission", e);
    Ok(Permission {
        id: PermissionId::new(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        path: row.try_get("path").map_err(decode)?,
        method: row.try_get("method").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
    })
}

fn role_from_row(row: &PgRow) -> Result<Role, StoreError> {
    let decode = |e| map_sqlx_error("decode_role", e);
    Ok(Role {
        id: RoleId::new(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let decode = |e| map_sqlx_error("decode_user", e);
    Ok(User {
        id: UserId::new(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
    })
}

fn names_from_rows(rows: &[PgRow]) -> Result<Vec<String>, StoreError> {
    rows.iter()
        .map(|row| row.try_get("name").map_err(|e| map_sqlx_error("decode_name", e)))
        .collect()
}

/// Map SQLx errors to `StoreError`.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("23503") => StoreError::Constraint(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("no row in {}", operation)),
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        other => StoreError::Backend(format!("sqlx error in {}: {}", operation, other)),
    }
}
