use std::path::Path;

use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Schema, sea_query::OnConflict,
};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::{error::StoreError, ssh::Credentials};

/// Durable projection of a live forward, enough to re-open it after a restart.
#[derive(Debug, Clone)]
pub struct ForwardRecord {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub local_address: String,
    pub remote_address: String,
    // Credentials of the owning session. Stored as plain text, so the database is only readable by its owner.
    pub credentials: Credentials,
}

mod forward {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "forwards")]
    pub struct Model {
        // Composite forward id.
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub user: String,
        pub host: String,
        pub port: i32,
        pub local_address: String,
        pub remote_address: String,
        pub password: Option<String>,
        pub private_key: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

impl TryFrom<forward::Model> for ForwardRecord {
    type Error = StoreError;

    fn try_from(model: forward::Model) -> Result<Self, Self::Error> {
        Ok(ForwardRecord {
            port: u16::try_from(model.port).map_err(|_| StoreError::InvalidPort(model.port))?,
            user: model.user,
            host: model.host,
            local_address: model.local_address,
            remote_address: model.remote_address,
            credentials: Credentials::new(model.password, model.private_key),
        })
    }
}

/// SQLite-backed store of forward records, keyed by composite id.
#[derive(Debug, Clone)]
pub struct ForwardStore {
    db: DatabaseConnection,
}

impl ForwardStore {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        debug!(%url, "Opening state database.");
        let db = Database::connect(&url).await?;
        let backend = db.get_database_backend();
        let mut statement = Schema::new(backend).create_table_from_entity(forward::Entity);
        statement.if_not_exists();
        db.execute(backend.build(&statement)).await?;
        #[cfg(unix)]
        {
            use std::{fs::Permissions, os::unix::fs::PermissionsExt};

            tokio::fs::set_permissions(path, Permissions::from_mode(0o600)).await?;
        }
        Ok(ForwardStore { db })
    }

    /// Insert a record, replacing any existing record with the same id.
    pub async fn put(&self, id: &str, record: &ForwardRecord) -> Result<(), StoreError> {
        let model = forward::ActiveModel {
            id: Set(id.to_string()),
            user: Set(record.user.clone()),
            host: Set(record.host.clone()),
            port: Set(i32::from(record.port)),
            local_address: Set(record.local_address.clone()),
            remote_address: Set(record.remote_address.clone()),
            password: Set(expose(record.credentials.password.as_ref())),
            private_key: Set(expose(record.credentials.private_key.as_ref())),
        };
        forward::Entity::insert(model)
            .on_conflict(
                OnConflict::column(forward::Column::Id)
                    .update_columns([
                        forward::Column::User,
                        forward::Column::Host,
                        forward::Column::Port,
                        forward::Column::LocalAddress,
                        forward::Column::RemoteAddress,
                        forward::Column::Password,
                        forward::Column::PrivateKey,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ForwardRecord>, StoreError> {
        forward::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .map(ForwardRecord::try_from)
            .transpose()
    }

    pub async fn list_all(&self) -> Result<Vec<(String, ForwardRecord)>, StoreError> {
        forward::Entity::find()
            .order_by_asc(forward::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|model| Ok((model.id.clone(), ForwardRecord::try_from(model)?)))
            .collect()
    }

    /// Delete every record with one of the given ids, returning how many were removed.
    pub async fn delete(&self, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = forward::Entity::delete_many()
            .filter(forward::Column::Id.is_in(ids.iter().cloned()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn clear_all(&self) -> Result<u64, StoreError> {
        let result = forward::Entity::delete_many().exec(&self.db).await?;
        Ok(result.rows_affected)
    }
}

fn expose(secret: Option<&SecretString>) -> Option<String> {
    secret.map(|secret| secret.expose_secret().to_string())
}
