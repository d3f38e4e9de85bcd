mod migration_task;
