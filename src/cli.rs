use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
/// create the database schema (tables and indexes)
#[argh(subcommand, name = "create-schema")]
pub(crate) struct CreateSchema {}

#[derive(FromArgs, PartialEq, Debug)]
/// load RPM files into the database
#[argh(subcommand, name = "load-rpm")]
pub(crate) struct LoadRpm {
    /// paths of RPM files to load
    #[argh(positional)]
    pub paths: Vec<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// create a package set from RPM files
#[argh(subcommand, name = "create-set")]
pub(crate) struct CreateSet {
    /// name of the new package set
    #[argh(positional)]
    pub name: String,
    /// paths of RPM files forming the set
    #[argh(positional)]
    pub paths: Vec<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// download repositories and replace the membership of a package set
#[argh(subcommand, name = "update-set-from-repo")]
pub(crate) struct UpdateSetFromRepo {
    /// name of the package set to update
    #[argh(positional)]
    pub name: String,
    /// repository base URLs
    #[argh(positional)]
    pub urls: Vec<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// download repository packages into the cache without loading them
#[argh(subcommand, name = "download-repo")]
pub(crate) struct DownloadRepo {
    /// repository base URLs
    #[argh(positional)]
    pub urls: Vec<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// report unresolvable and ambiguous soname references in a set
#[argh(subcommand, name = "show-soname-conflicts")]
pub(crate) struct ShowSonameConflicts {
    /// name of the package set
    #[argh(positional)]
    pub set: String,
}

#[derive(FromArgs, PartialEq, Debug)]
/// expire cached URLs and unreferenced packages, contents and classes
#[argh(subcommand, name = "expire")]
pub(crate) struct Expire {}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub(crate) enum SymbolDbCommand {
    CreateSchema(CreateSchema),
    LoadRpm(LoadRpm),
    CreateSet(CreateSet),
    UpdateSetFromRepo(UpdateSetFromRepo),
    DownloadRepo(DownloadRepo),
    ShowSonameConflicts(ShowSonameConflicts),
    Expire(Expire),
}

#[derive(FromArgs, PartialEq, Debug)]
/// symboldb: a relational catalogue of RPM package internals
pub(crate) struct SymbolDb {
    /// specify the location of the config file
    #[argh(option, short = 'c')]
    pub config: Option<String>,
    /// package cache directory
    #[argh(option)]
    pub cache: Option<String>,
    /// do not touch the network; rely on caches only
    #[argh(switch)]
    pub no_net: bool,
    /// package set name for load-rpm
    #[argh(option)]
    pub set: Option<String>,
    /// regular expression of package names to exclude
    #[argh(option)]
    pub exclude_name: Option<String>,
    /// continue when individual packages fail to download
    #[argh(switch)]
    pub ignore_download_errors: bool,
    /// verbose output
    #[argh(switch, short = 'v')]
    pub verbose: bool,
    /// only report errors
    #[argh(switch, short = 'q')]
    pub quiet: bool,
    #[argh(subcommand)]
    pub command: SymbolDbCommand,
}
