#![forbid(unsafe_code)]

pub(super) const BLOCK: &str = r#"

        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
          id INTEGER PRIMARY KEY,
          status INTEGER NOT NULL,
          affinity_id INTEGER NOT NULL DEFAULT 0,
          input TEXT NOT NULL,
          output TEXT NOT NULL DEFAULT '',
          progress_msg TEXT NOT NULL DEFAULT '',
          submit_ms INTEGER NOT NULL,
          timeout_s INTEGER NOT NULL DEFAULT 0,
          run_timeout_s INTEGER NOT NULL DEFAULT 0,
          run_deadline_ms INTEGER,
          subm_addr TEXT NOT NULL DEFAULT '',
          subm_port INTEGER NOT NULL DEFAULT 0,
          subm_timeout_s INTEGER NOT NULL DEFAULT 0,
          mask INTEGER NOT NULL DEFAULT 0,
          run_count INTEGER NOT NULL DEFAULT 0,
          read_count INTEGER NOT NULL DEFAULT 0,
          read_group INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS job_runs (
          job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
          seq INTEGER NOT NULL,
          status INTEGER NOT NULL,
          start_ms INTEGER NOT NULL,
          done_ms INTEGER,
          ret_code INTEGER,
          err_msg TEXT NOT NULL DEFAULT '',
          node_id TEXT NOT NULL DEFAULT '',
          client_ip TEXT NOT NULL DEFAULT '',
          client_port INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY (job_id, seq)
        );

        CREATE TABLE IF NOT EXISTS job_tags (
          job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
          key TEXT NOT NULL,
          value TEXT NOT NULL,
          PRIMARY KEY (job_id, key)
        );

        CREATE TABLE IF NOT EXISTS affinities (
          id INTEGER PRIMARY KEY,
          token TEXT NOT NULL UNIQUE
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, id);
        CREATE INDEX IF NOT EXISTS idx_job_tags_lookup ON job_tags(key, value, job_id);
"#;

pub(super) const ADMIN: &str = r#"

        CREATE TABLE IF NOT EXISTS queues (
          name TEXT PRIMARY KEY,
          kind TEXT NOT NULL,
          position INTEGER NOT NULL UNIQUE,
          class TEXT,
          comment TEXT NOT NULL DEFAULT '',
          params_json TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
"#;

pub(super) const TRUNCATE_BLOCK: &str = r#"
        DELETE FROM job_tags;
        DELETE FROM job_runs;
        DELETE FROM jobs;
        DELETE FROM affinities;
        DELETE FROM meta;
"#;
