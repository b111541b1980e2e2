//! Patroni configuration template
//!
//! The template is rendered with handlebars in strict mode, so a reference
//! to an unknown placeholder fails the run instead of rendering empty. HTML
//! escaping is disabled; the output is YAML and is parsed right away.

use crate::error::{ConfigureError, Result};
use crate::placeholders::Placeholders;
use handlebars::Handlebars;
use serde_yaml::Value;

/// Default Patroni configuration.
pub const TEMPLATE: &str = r##"
bootstrap:
  post_init: /scripts/post_init.sh "{{HUMAN_ROLE}}"
  dcs:
    {{#if STANDBY_CLUSTER}}
    standby_cluster:
      create_replica_methods:
      {{#if STANDBY_WITH_WALE}}
      - bootstrap_standby_with_wale
      {{/if}}
      - basebackup_fast_xlog
      {{#if STANDBY_WITH_WALE}}
      restore_command: envdir "{{STANDBY_WALE_ENV_DIR}}" timeout "{{WAL_RESTORE_TIMEOUT}}"
        /scripts/restore_command.sh "%f" "%p"
      {{/if}}
      {{#if STANDBY_HOST}}
      host: {{STANDBY_HOST}}
      {{/if}}
      {{#if STANDBY_PORT}}
      port: {{STANDBY_PORT}}
      {{/if}}
      {{#if STANDBY_PRIMARY_SLOT_NAME}}
      primary_slot_name: {{STANDBY_PRIMARY_SLOT_NAME}}
      {{/if}}
    {{/if}}
    ttl: 30
    loop_wait: &loop_wait 10
    retry_timeout: 10
    maximum_lag_on_failover: 33554432
    postgresql:
      use_pg_rewind: true
      use_slots: true
      parameters:
        archive_mode: "on"
        archive_timeout: 1800s
        wal_level: hot_standby
        wal_log_hints: 'on'
        wal_compression: 'on'
        max_wal_senders: 10
        max_connections: {{postgresql.parameters.max_connections}}
        max_replication_slots: 10
        hot_standby: 'on'
        tcp_keepalives_idle: 300
        tcp_keepalives_interval: 30
        log_line_prefix: '%t [%p]: [%l-1] %c %x %d %u %a %h '
        log_checkpoints: 'on'
        log_lock_waits: 'on'
        log_min_duration_statement: 500
        log_autovacuum_min_duration: 0
        log_connections: 'on'
        log_disconnections: 'on'
        log_statement: 'ddl'
        log_temp_files: 0
        track_functions: all
        checkpoint_completion_target: 0.9
        autovacuum_max_workers: 5
        autovacuum_vacuum_scale_factor: 0.05
        autovacuum_analyze_scale_factor: 0.02
  {{#if CLONE_WITH_WALE}}
  method: clone_with_wale
  clone_with_wale:
    command: envdir "{{CLONE_WALE_ENV_DIR}}" python3 /scripts/clone_with_wale.py
      --recovery-target-time="{{CLONE_TARGET_TIME}}"
    recovery_conf:
        restore_command: envdir "{{CLONE_WALE_ENV_DIR}}" timeout "{{WAL_RESTORE_TIMEOUT}}"
          /scripts/restore_command.sh "%f" "%p"
        recovery_target_timeline: "{{CLONE_TARGET_TIMELINE}}"
        {{#if USE_PAUSE_AT_RECOVERY_TARGET}}
        recovery_target_action: pause
        {{/if}}
        {{#unless USE_PAUSE_AT_RECOVERY_TARGET}}
        recovery_target_action: promote
        {{/unless}}
        {{#if CLONE_TARGET_TIME}}
        recovery_target_time: "{{CLONE_TARGET_TIME}}"
        {{/if}}
        {{#unless CLONE_TARGET_INCLUSIVE}}
        recovery_target_inclusive: false
        {{/unless}}
  {{/if}}
  {{#if CLONE_WITH_BASEBACKUP}}
  method: clone_with_basebackup
  clone_with_basebackup:
    command: python3 /scripts/clone_with_basebackup.py --pgpass={{CLONE_PGPASS}} --host={{CLONE_HOST}}
      --port={{CLONE_PORT}} --user="{{CLONE_USER}}"
  {{/if}}
  initdb:
    - encoding: UTF8
    - locale: {{INITDB_LOCALE}}.UTF-8
    - data-checksums
  {{#if USE_ADMIN}}
  users:
    {{PGUSER_ADMIN}}:
      password: {{PGPASSWORD_ADMIN}}
      options:
        - createrole
        - createdb
  {{/if}}
scope: &scope '{{SCOPE}}'
restapi:
  listen: ':{{APIPORT}}'
  connect_address: {{RESTAPI_CONNECT_ADDRESS}}:{{APIPORT}}
  {{#if SSL_RESTAPI_CA_FILE}}
  cafile: {{SSL_RESTAPI_CA_FILE}}
  {{/if}}
  {{#if SSL_RESTAPI_CERTIFICATE_FILE}}
  certfile: {{SSL_RESTAPI_CERTIFICATE_FILE}}
  {{/if}}
  {{#if SSL_RESTAPI_PRIVATE_KEY_FILE}}
  keyfile: {{SSL_RESTAPI_PRIVATE_KEY_FILE}}
  {{/if}}
postgresql:
  pgpass: /run/postgresql/pgpass
  use_unix_socket: true
  use_unix_socket_repl: true
  name: '{{instance_data.id}}'
  listen: '*:{{PGPORT}}'
  connect_address: {{instance_data.ip}}:{{PGPORT}}
  data_dir: {{PGDATA}}
  parameters:
    archive_command: {{{postgresql.parameters.archive_command}}}
    logging_collector: 'on'
    log_destination: csvlog
    log_directory: ../pg_log
    log_filename: 'postgresql-%u.log'
    log_file_mode: '0644'
    log_rotation_age: '1d'
    log_truncate_on_rotation: 'on'
    ssl: 'on'
    {{#if SSL_CA_FILE}}
    ssl_ca_file: {{SSL_CA_FILE}}
    {{/if}}
    {{#if SSL_CRL_FILE}}
    ssl_crl_file: {{SSL_CRL_FILE}}
    {{/if}}
    ssl_cert_file: {{SSL_CERTIFICATE_FILE}}
    ssl_key_file: {{SSL_PRIVATE_KEY_FILE}}
    shared_preload_libraries: 'bg_mon,pg_stat_statements,pgextwlist,pg_auth_mon,set_user,columnar,pg_cron'
    bg_mon.listen_address: '{{BGMON_LISTEN_IP}}'
    bg_mon.history_buckets: 120
    pg_stat_statements.track_utility: 'off'
    extwlist.extensions: 'btree_gin,btree_gist,citext,extra_window_functions,first_last_agg,hll,hstore,hypopg,intarray,ltree,pgcrypto,pgq,pgq_node,pg_ivm,pg_trgm,postgres_fdw,mysql_fdw,multicorn,parquet_s3_fdw,vector,tablefunc,uuid-ossp'
    extwlist.custom_path: /scripts
    cron.use_background_workers: 'on'
  pg_hba:
    - local   all             all                                   trust
    {{#if PAM_OAUTH2}}
    - hostssl all             +{{HUMAN_ROLE}}    127.0.0.1/32       pam
    {{/if}}
    - host    all             all                127.0.0.1/32       md5
    {{#if PAM_OAUTH2}}
    - hostssl all             +{{HUMAN_ROLE}}    ::1/128            pam
    {{/if}}
    - host    all             all                ::1/128            md5
    - local   replication     {{PGUSER_STANDBY}}                    trust
    - hostssl replication     {{PGUSER_STANDBY}} all                md5
    {{#unless ALLOW_NOSSL}}
    - hostnossl all           all                all                reject
    {{/unless}}
    {{#if PAM_OAUTH2}}
    - hostssl all             +{{HUMAN_ROLE}}    all                pam
    {{/if}}
    {{#if ALLOW_NOSSL}}
    - host    all             all                all                md5
    {{/if}}
    {{#unless ALLOW_NOSSL}}
    - hostssl all             all                all                md5
    {{/unless}}

  {{#if USE_WALE}}
  recovery_conf:
    restore_command: envdir "{{WALE_ENV_DIR}}" timeout "{{WAL_RESTORE_TIMEOUT}}"
      /scripts/restore_command.sh "%f" "%p"
  {{/if}}
  authentication:
    superuser:
      username: {{PGUSER_SUPERUSER}}
      password: '{{PGPASSWORD_SUPERUSER}}'
    replication:
      username: {{PGUSER_STANDBY}}
      password: '{{PGPASSWORD_STANDBY}}'
  callbacks:
  {{#if CALLBACK_SCRIPT}}
    on_start: {{CALLBACK_SCRIPT}}
    on_stop: {{CALLBACK_SCRIPT}}
    on_role_change: '/scripts/on_role_change.sh {{HUMAN_ROLE}} {{CALLBACK_SCRIPT}}'
  {{else}}
    on_role_change: '/scripts/on_role_change.sh {{HUMAN_ROLE}} true'
  {{/if}}
  create_replica_method:
  {{#if USE_WALE}}
    - wal_e
  {{/if}}
    - basebackup_fast_xlog
  {{#if USE_WALE}}
  wal_e:
    command: envdir {{WALE_ENV_DIR}} bash /scripts/wale_restore.sh
    threshold_megabytes: {{WALE_BACKUP_THRESHOLD_MEGABYTES}}
    threshold_backup_size_percentage: {{WALE_BACKUP_THRESHOLD_PERCENTAGE}}
    retries: 2
    no_master: 1
  {{/if}}
  basebackup_fast_xlog:
    command: /scripts/basebackup.sh
    retries: 2
{{#if STANDBY_WITH_WALE}}
  bootstrap_standby_with_wale:
    command: envdir "{{STANDBY_WALE_ENV_DIR}}" bash /scripts/wale_restore.sh
    threshold_megabytes: {{WALE_BACKUP_THRESHOLD_MEGABYTES}}
    threshold_backup_size_percentage: {{WALE_BACKUP_THRESHOLD_PERCENTAGE}}
    retries: 2
    no_master: 1
{{/if}}
"##;

/// Render `template` against the placeholders in strict mode.
pub fn render(template: &str, placeholders: &Placeholders) -> Result<String> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);
    Ok(registry.render_template(template, placeholders)?)
}

/// Render the Patroni template and parse it into a YAML document.
pub fn render_config(placeholders: &Placeholders) -> Result<Value> {
    let rendered = render(TEMPLATE, placeholders)?;
    serde_yaml::from_str(&rendered).map_err(|source| ConfigureError::Yaml {
        what: "rendered configuration".to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InstanceMetadata;
    use crate::placeholders::{derive_placeholders, DerivationInput};
    use crate::provider::Provider;
    use crate::system::SystemFacts;
    use common::Environment;

    fn placeholders(pairs: &[(&str, &str)]) -> Placeholders {
        let env = Environment::from_pairs(pairs.iter().copied());
        let system = SystemFacts::fixture();
        let input = DerivationInput {
            env: &env,
            provider: Provider::Local,
            instance: InstanceMetadata::local(&system, &env, false),
            system: &system,
        };
        derive_placeholders(&input).unwrap()
    }

    #[test]
    fn test_missing_placeholder_is_fatal() {
        let p = placeholders(&[]);
        assert!(matches!(
            render("scope: {{NOT_DEFINED}}", &p),
            Err(ConfigureError::Render(_))
        ));
    }

    #[test]
    fn test_values_are_not_html_escaped() {
        let mut p = Placeholders::default();
        p.set("PASSWORD", "a<b&c");
        assert_eq!(render("{{PASSWORD}}", &p).unwrap(), "a<b&c");
    }

    #[test]
    fn test_each_over_list_placeholder() {
        let mut p = Placeholders::default();
        p.set("SCOPE", "demo");
        p.set("HOSTS", vec!["10.0.0.1:2379", "10.0.0.2:2379"]);
        p.set("NO_HOSTS", Vec::<&str>::new());
        let template = "scope: {{SCOPE}}\nhosts:\n{{#each HOSTS}}\n  - {{this}}\n{{/each}}\n\
                        {{#unless NO_HOSTS}}\nstandalone: true\n{{/unless}}\n";
        let config: Value = serde_yaml::from_str(&render(template, &p).unwrap()).unwrap();
        assert_eq!(
            config["hosts"],
            Value::Sequence(vec![Value::from("10.0.0.1:2379"), Value::from("10.0.0.2:2379")])
        );
        assert_eq!(config["standalone"], Value::from(true));
    }

    #[test]
    fn test_default_render_parses() {
        let config = render_config(&placeholders(&[("SCOPE", "demo")])).unwrap();
        assert_eq!(config["scope"], Value::from("demo"));
        assert_eq!(config["restapi"]["connect_address"], Value::from("10.0.0.5:8008"));
        assert_eq!(config["postgresql"]["name"], Value::from("spilo-0"));
        assert_eq!(
            config["postgresql"]["parameters"]["archive_command"],
            Value::from("/bin/true")
        );
        assert_eq!(
            config["bootstrap"]["dcs"]["postgresql"]["parameters"]["max_connections"],
            Value::from(300)
        );
        assert_eq!(
            config["postgresql"]["callbacks"]["on_role_change"],
            Value::from("/scripts/on_role_change.sh zalandos true")
        );
        assert!(config["bootstrap"]["dcs"].get("standby_cluster").is_none());
        assert!(config["bootstrap"].get("users").is_none());
        assert!(config["postgresql"].get("recovery_conf").is_none());
        assert_eq!(
            config["postgresql"]["create_replica_method"],
            serde_yaml::from_str::<Value>("[basebackup_fast_xlog]").unwrap()
        );

        let hba = config["postgresql"]["pg_hba"].as_sequence().unwrap();
        assert!(hba
            .iter()
            .filter_map(Value::as_str)
            .any(|entry| entry.starts_with("hostnossl")));
    }

    #[test]
    fn test_archive_sections_follow_storage() {
        let config =
            render_config(&placeholders(&[("WAL_S3_BUCKET", "b"), ("SCOPE", "demo")])).unwrap();
        assert_eq!(
            config["postgresql"]["parameters"]["archive_command"],
            Value::from("envdir \"/run/etc/wal-e.d/env\" wal-e wal-push \"%p\"")
        );
        assert_eq!(
            config["postgresql"]["recovery_conf"]["restore_command"],
            Value::from(
                "envdir \"/run/etc/wal-e.d/env\" timeout \"0\" /scripts/restore_command.sh \"%f\" \"%p\""
            )
        );
        assert_eq!(
            config["postgresql"]["wal_e"]["threshold_megabytes"],
            Value::from(102400)
        );
    }

    #[test]
    fn test_standby_cluster_section() {
        let config = render_config(&placeholders(&[
            ("STANDBY_HOST", "10.0.0.9"),
            ("STANDBY_PORT", "5433"),
        ]))
        .unwrap();
        let standby = &config["bootstrap"]["dcs"]["standby_cluster"];
        assert_eq!(standby["host"], Value::from("10.0.0.9"));
        assert_eq!(standby["port"], Value::from(5433));
        assert_eq!(
            standby["create_replica_methods"],
            serde_yaml::from_str::<Value>("[basebackup_fast_xlog]").unwrap()
        );
    }

    #[test]
    fn test_clone_with_basebackup_section() {
        let config = render_config(&placeholders(&[
            ("CLONE_METHOD", "CLONE_WITH_BASEBACKUP"),
            ("CLONE_SCOPE", "source"),
            ("CLONE_HOST", "10.0.0.1"),
            ("CLONE_USER", "standby"),
            ("CLONE_PASSWORD", "pw"),
        ]))
        .unwrap();
        assert_eq!(config["bootstrap"]["method"], Value::from("clone_with_basebackup"));
        assert_eq!(
            config["bootstrap"]["clone_with_basebackup"]["command"],
            Value::from(
                "python3 /scripts/clone_with_basebackup.py --pgpass=/home/postgres/.pgpass_source \
                 --host=10.0.0.1 --port=5432 --user=\"standby\""
            )
        );
    }

    #[test]
    fn test_admin_and_nossl_sections() {
        let config = render_config(&placeholders(&[
            ("PGPASSWORD_ADMIN", "pw"),
            ("ALLOW_NOSSL", "true"),
            ("CALLBACK_SCRIPT", "/bin/cb"),
        ]))
        .unwrap();
        assert_eq!(
            config["bootstrap"]["users"]["admin"]["password"],
            Value::from("pw")
        );
        let hba: Vec<&str> = config["postgresql"]["pg_hba"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(!hba.iter().any(|e| e.starts_with("hostnossl")));
        assert!(hba.iter().any(|e| e.starts_with("host    all             all                all")));
        assert_eq!(config["postgresql"]["callbacks"]["on_start"], Value::from("/bin/cb"));
    }
}
