table! {
    build_pipes (from_build_id, to_build_id) {
        from_build_id -> Int4,
        to_build_id -> Int4,
    }
}

table! {
    build_resource_config_version_inputs (build_id, resource_id, version_md5, name) {
        build_id -> Int4,
        resource_id -> Int4,
        version_md5 -> Varchar,
        name -> Varchar,
    }
}

table! {
    build_resource_config_version_outputs (build_id, resource_id, version_md5, name) {
        build_id -> Int4,
        resource_id -> Int4,
        version_md5 -> Varchar,
        name -> Varchar,
    }
}

table! {
    builds (id) {
        id -> Int4,
        job_id -> Int4,
        name -> Varchar,
        status -> Varchar,
        rerun_of -> Nullable<Int4>,
        inputs_ready -> Bool,
        scheduled -> Bool,
        needs_v6_migration -> Bool,
        start_time -> Nullable<Timestamptz>,
        end_time -> Nullable<Timestamptz>,
        plan -> Nullable<Jsonb>,
    }
}

table! {
    jobs (id) {
        id -> Int4,
        pipeline_id -> Int4,
        name -> Varchar,
    }
}

table! {
    pipelines (id) {
        id -> Int4,
        name -> Varchar,
        team_name -> Varchar,
    }
}

table! {
    resource_configs (id) {
        id -> Int4,
        source_hash -> Varchar,
    }
}

table! {
    resource_config_scopes (id) {
        id -> Int4,
        resource_config_id -> Int4,
        resource_id -> Nullable<Int4>,
        default_space -> Nullable<Varchar>,
        last_check_finished -> Nullable<Timestamptz>,
    }
}

table! {
    resource_disabled_versions (resource_id, version_md5) {
        resource_id -> Int4,
        version_md5 -> Varchar,
    }
}

table! {
    resource_types (id) {
        id -> Int4,
        pipeline_id -> Int4,
        name -> Varchar,
        #[sql_name = "type"]
        type_ -> Varchar,
        resource_config_scope_id -> Nullable<Int4>,
        check_error -> Nullable<Text>,
    }
}

table! {
    resource_versions (id) {
        id -> Int4,
        space_id -> Int4,
        version -> Jsonb,
        version_md5 -> Varchar,
        metadata -> Jsonb,
        check_order -> Int4,
        partial -> Bool,
    }
}

table! {
    resources (id) {
        id -> Int4,
        pipeline_id -> Int4,
        name -> Varchar,
        #[sql_name = "type"]
        type_ -> Varchar,
        resource_config_scope_id -> Nullable<Int4>,
        check_error -> Nullable<Text>,
    }
}

table! {
    spaces (id) {
        id -> Int4,
        resource_config_scope_id -> Int4,
        name -> Varchar,
        latest_resource_version_id -> Nullable<Int4>,
    }
}

table! {
    successful_build_outputs (build_id) {
        build_id -> Int4,
        job_id -> Int4,
        outputs -> Jsonb,
        rerun_of -> Nullable<Int4>,
    }
}

joinable!(builds -> jobs (job_id));
joinable!(jobs -> pipelines (pipeline_id));
joinable!(resource_config_scopes -> resource_configs (resource_config_id));
joinable!(resource_versions -> spaces (space_id));
joinable!(resources -> pipelines (pipeline_id));
joinable!(spaces -> resource_config_scopes (resource_config_scope_id));
joinable!(successful_build_outputs -> jobs (job_id));

allow_tables_to_appear_in_same_query!(
    build_pipes,
    build_resource_config_version_inputs,
    build_resource_config_version_outputs,
    builds,
    jobs,
    pipelines,
    resource_configs,
    resource_config_scopes,
    resource_disabled_versions,
    resource_types,
    resource_versions,
    resources,
    spaces,
    successful_build_outputs,
);
