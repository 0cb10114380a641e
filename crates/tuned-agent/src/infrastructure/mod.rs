pub mod api;
pub mod control_socket;
pub mod fs_watcher;
pub mod k8s;
pub mod kube_client;
pub mod label_files;
pub mod pid_file;
pub mod profiles;
pub mod tuned_status;
