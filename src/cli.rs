//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use clap::crate_authors;
use clap::crate_version;
use clap::Arg;
use clap::Command;

pub fn cli() -> Command {
    Command::new("conveyor")
        .author(crate_authors!())
        .version(crate_version!())
        .about("Execution and resource version tracking core for container-native CI pipelines")
        .subcommand_required(true)
        .arg_required_else_help(true)

        .after_help(indoc::indoc!(r#"
            The following environment variables can be passed to conveyor:

                RUST_LOG - to enable logging, for exact usage see the rust cookbook
        "#))

        .arg(Arg::new("database_host")
            .required(false)
            .num_args(1)
            .long("db-url")
            .value_name("HOST")
            .help("Override the database host")
            .long_help(indoc::indoc!(r#"
                Override the database host set via configuration.
                Can also be overridden via environment variable 'CONVEYOR_DATABASE_HOST', but this setting has precedence.
            "#))
        )
        .arg(Arg::new("database_port")
            .required(false)
            .num_args(1)
            .long("db-port")
            .value_name("PORT")
            .help("Override the database port")
        )
        .arg(Arg::new("database_user")
            .required(false)
            .num_args(1)
            .long("db-user")
            .value_name("USER")
            .help("Override the database user")
        )
        .arg(Arg::new("database_password")
            .required(false)
            .num_args(1)
            .long("db-password")
            .value_name("PASSWORD")
            .help("Override the database password")
        )
        .arg(Arg::new("database_name")
            .required(false)
            .num_args(1)
            .long("db-name")
            .value_name("NAME")
            .help("Override the database name")
        )
        .arg(Arg::new("database_connection_timeout")
            .required(false)
            .num_args(1)
            .long("db-timeout")
            .value_name("TIMEOUT")
            .help("Override the database connection timeout")
        )

        .subcommand(Command::new("run")
            .about("Run the build engine against the configured worker")
            .long_about(indoc::indoc!(r#"
                Supervise builds until interrupted.

                The engine periodically looks for builds that should be
                running, acquires each build's tracking lock and drives its
                step tree to completion. On SIGINT the engine drains: running
                builds are released (not finished) and will be picked up by
                the next tracker.
            "#))
        )
}
