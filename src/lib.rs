// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Aggregate Debian/Ubuntu packages from heterogeneous upstream feeds into a
single signed APT repository.

debmill downloads binary and source packages from code-hosting release pages,
plain APT repositories, and build-service projects; verifies each file
against a signed trust anchor; filters versions with declarative retention
policies; and re-emits everything as a conforming APT repository tree that
`apt` can consume directly.

# A Tour of Functionality

The pipeline runs in three phases communicating only through the trusted
store on disk:

1. **Fetch.** Each feed adapter in [feed] discovers upstream metadata
   (`InRelease` manifests for APT layouts, `.changes` files on release
   pages), downloads the files it declares through the deduplicating
   [download::Downloader], verifies every byte against a declared SHA-256,
   and hardlinks verified files into its scope of the
   [store::TrustedStore].

2. **Compose.** The [compose::Composer] walks the trusted store, parses
   `.deb`/`.ddeb`/`.dsc` files back into [package::Package] values, applies
   the pattern-based [retention] engine per
   `(distribution, component, name, architecture)`, and builds the
   [repository::Repository] model.

3. **Emit and sign.** Per-architecture `Packages`/`Sources` indices are
   written in canonical order with three compressed variants, checksummed
   into a `Release` file ([release]), and signed inline (`InRelease`) and
   detached (`Release.gpg`) by [signature::RepoSigner].

Control-file primitives live in [control]; Debian version ordering in
[package_version]; `.changes` parsing in [changes]; `.deb` reading in [deb].
The [runtime::Runtime] gathers the process singletons (HTTP client, bounded
download/compression limits, the hardlink mutex, and the cancellation
token) and is passed explicitly.

An alternative *redirect* pool mode emits indices whose `Filename` and
`Directory` fields reference upstream URLs through per-feed redirect maps,
so the published tree carries only metadata.
*/

pub mod app;
pub mod changes;
pub mod collector;
pub mod compose;
pub mod config;
pub mod control;
pub mod deb;
pub mod download;
pub mod error;
pub mod feed;
pub mod filters;
pub mod io;
pub mod package;
pub mod package_version;
pub mod release;
pub mod repository;
pub mod retention;
pub mod runtime;
pub mod signature;
pub mod store;
